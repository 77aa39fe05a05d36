//! Session artifacts on disk
//!
//! - log sessions: `log_<start>.jsonl`, one [`SessionPoint`] per line
//! - graph sessions: `graph_<start>.json`, metadata plus the ordered points
//!
//! Both are written to a temp file, synced, then renamed into place. An
//! existing artifact is never replaced: a name already taken gets a numeric
//! suffix.

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Local};
use serde::{Deserialize, Serialize};
use sh_error::{Result, ShopHeaterError};
use tracing::info;

use crate::session::{FinishedSession, SessionKind, SessionPoint, SessionSink};

/// Timestamp format used in artifact file names
const FILE_STAMP: &str = "%Y%m%d_%H%M%S_%3f";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct GraphMetadata {
    pub start_time: DateTime<Local>,
    pub end_time: DateTime<Local>,
    pub duration_seconds: f64,
    pub data_points: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct GraphArtifact {
    pub metadata: GraphMetadata,
    pub points: Vec<SessionPoint>,
}

#[derive(Debug, Clone)]
pub struct FileSessionStore {
    dir: PathBuf,
}

impl FileSessionStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Preferred file name for `session`
    pub fn artifact_path(&self, session: &FinishedSession) -> PathBuf {
        self.dir.join(Self::file_name(session, None))
    }

    fn file_name(session: &FinishedSession, suffix: Option<u32>) -> String {
        let stamp = session.started_at.format(FILE_STAMP);
        let suffix = suffix.map(|n| format!("-{}", n)).unwrap_or_default();
        match session.kind {
            SessionKind::Log => format!("log_{}{}.jsonl", stamp, suffix),
            SessionKind::Graph => format!("graph_{}{}.json", stamp, suffix),
        }
    }

    /// First name for `session` not already on disk
    fn free_path(&self, session: &FinishedSession) -> PathBuf {
        let mut path = self.artifact_path(session);
        let mut n = 1;
        while path.exists() {
            path = self.dir.join(Self::file_name(session, Some(n)));
            n += 1;
        }
        path
    }

    fn render(session: &FinishedSession) -> Result<Vec<u8>> {
        match session.kind {
            SessionKind::Log => {
                let mut out = Vec::new();
                for point in &session.points {
                    serde_json::to_writer(&mut out, point)?;
                    out.push(b'\n');
                }
                Ok(out)
            }
            SessionKind::Graph => {
                let artifact = GraphArtifact {
                    metadata: GraphMetadata {
                        start_time: session.started_at,
                        end_time: session.ended_at,
                        duration_seconds: session.duration_seconds(),
                        data_points: session.data_points(),
                    },
                    points: session.points.clone(),
                };
                Ok(serde_json::to_vec_pretty(&artifact)?)
            }
        }
    }
}

fn write_atomic(path: &Path, bytes: &[u8]) -> Result<()> {
    let temp_path = path.with_extension("tmp");

    let mut file = fs::File::create(&temp_path).map_err(|e| ShopHeaterError::FileWrite {
        path: temp_path.clone(),
        source: e,
    })?;
    file.write_all(bytes).map_err(|e| ShopHeaterError::FileWrite {
        path: temp_path.clone(),
        source: e,
    })?;
    file.sync_all().map_err(|e| ShopHeaterError::FileWrite {
        path: temp_path.clone(),
        source: e,
    })?;
    drop(file);

    fs::rename(&temp_path, path).map_err(|e| ShopHeaterError::FileWrite {
        path: path.to_path_buf(),
        source: e,
    })
}

impl SessionSink for FileSessionStore {
    fn persist(&self, session: &FinishedSession) -> Result<()> {
        let kind = session.kind.as_str();
        fs::create_dir_all(&self.dir)
            .map_err(|e| ShopHeaterError::persistence(kind, format!("{:?}: {}", self.dir, e)))?;

        let path = self.free_path(session);
        let bytes = Self::render(session)?;
        write_atomic(&path, &bytes).map_err(|e| ShopHeaterError::persistence(kind, e.to_string()))?;

        info!(session = kind, points = session.data_points(), "Session saved to {:?}", path);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sh_protocol::{ControlMode, Deltas, FlowMode, Temperatures};

    fn finished(kind: SessionKind, n: usize) -> FinishedSession {
        let started_at = Local::now();
        let points = (0..n)
            .map(|i| SessionPoint {
                timestamp: started_at + chrono::Duration::milliseconds(500 * i as i64),
                temperatures: Temperatures {
                    water_hot: Some(120.5),
                    ..Default::default()
                },
                deltas: Deltas::default(),
                flow_rate: i as f64,
                fan_speed: 40,
                main_loop_state: true,
                diversion_state: false,
                control_mode: ControlMode::Manual,
                flow_mode: FlowMode::Main,
            })
            .collect();
        FinishedSession {
            kind,
            started_at,
            ended_at: started_at + chrono::Duration::seconds(2),
            points,
        }
    }

    #[test]
    fn test_log_written_as_json_lines() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileSessionStore::new(dir.path());
        let session = finished(SessionKind::Log, 3);
        store.persist(&session).unwrap();

        let path = store.artifact_path(&session);
        assert!(path.file_name().unwrap().to_str().unwrap().starts_with("log_"));
        let content = fs::read_to_string(&path).unwrap();
        let records: Vec<SessionPoint> = content
            .lines()
            .map(|l| serde_json::from_str(l).unwrap())
            .collect();
        assert_eq!(records.len(), 3);
        assert_eq!(records[2].flow_rate, 2.0);
        assert_eq!(records[0].temperatures.water_hot, Some(120.5));
    }

    #[test]
    fn test_graph_carries_metadata() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileSessionStore::new(dir.path().join("nested"));
        let session = finished(SessionKind::Graph, 4);
        store.persist(&session).unwrap();

        let content = fs::read_to_string(store.artifact_path(&session)).unwrap();
        let artifact: GraphArtifact = serde_json::from_str(&content).unwrap();
        assert_eq!(artifact.metadata.data_points, 4);
        assert_eq!(artifact.metadata.duration_seconds, 2.0);
        assert_eq!(artifact.points.len(), 4);
    }

    #[test]
    fn test_no_temp_file_left_behind() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileSessionStore::new(dir.path());
        store.persist(&finished(SessionKind::Graph, 1)).unwrap();
        let names: Vec<_> = fs::read_dir(dir.path())
            .unwrap()
            .map(|e| e.unwrap().file_name().into_string().unwrap())
            .collect();
        assert_eq!(names.len(), 1);
        assert!(names[0].ends_with(".json"));
    }

    #[test]
    fn test_same_start_time_does_not_overwrite() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileSessionStore::new(dir.path());
        let first = finished(SessionKind::Log, 2);
        let mut second = finished(SessionKind::Log, 1);
        second.started_at = first.started_at;
        store.persist(&first).unwrap();
        store.persist(&second).unwrap();

        let mut records = 0;
        let mut files = 0;
        for entry in fs::read_dir(dir.path()).unwrap() {
            let content = fs::read_to_string(entry.unwrap().path()).unwrap();
            records += content.lines().count();
            files += 1;
        }
        assert_eq!(files, 2);
        assert_eq!(records, 3);
        assert_eq!(fs::read_to_string(store.artifact_path(&first)).unwrap().lines().count(), 2);
    }

    #[test]
    fn test_stamp_has_millisecond_resolution() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileSessionStore::new(dir.path());
        let first = finished(SessionKind::Graph, 1);
        let mut second = finished(SessionKind::Graph, 1);
        second.started_at = first.started_at + chrono::Duration::milliseconds(1);
        assert_ne!(store.artifact_path(&first), store.artifact_path(&second));
    }

    #[test]
    fn test_unwritable_dir_is_persistence_error() {
        let dir = tempfile::tempdir().unwrap();
        let blocker = dir.path().join("blocker");
        fs::write(&blocker, "not a directory").unwrap();
        let store = FileSessionStore::new(blocker.join("sessions"));
        let err = store.persist(&finished(SessionKind::Log, 1)).unwrap_err();
        assert!(matches!(err, ShopHeaterError::Persistence { .. }));
    }
}
