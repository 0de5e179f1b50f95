use std::collections::HashMap;
use std::io::Write;

use crate::error::{TrackerError, TrackerResult};
use crate::types::{TagId, TagPose};

/// Sink for world-frame tag estimates, one call per estimated tag per cycle.
pub trait PosePublisher {
    fn publish(&mut self, pose: &TagPose) -> TrackerResult<()>;
}

/// Records every published pose in order.
impl PosePublisher for Vec<TagPose> {
    fn publish(&mut self, pose: &TagPose) -> TrackerResult<()> {
        self.push(*pose);
        Ok(())
    }
}

/// Latest pose per identity, keyed like a multi-instance output port.
#[derive(Debug, Default)]
pub struct PoseBoard {
    latest: HashMap<String, TagPose>,
    writes: u64,
}

impl PoseBoard {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, id: TagId) -> Option<&TagPose> {
        self.latest.get(&id.to_string())
    }

    pub fn keys(&self) -> impl Iterator<Item = &String> {
        self.latest.keys()
    }

    pub fn len(&self) -> usize {
        self.latest.len()
    }

    pub fn is_empty(&self) -> bool {
        self.latest.is_empty()
    }

    pub fn writes(&self) -> u64 {
        self.writes
    }
}

impl PosePublisher for PoseBoard {
    fn publish(&mut self, pose: &TagPose) -> TrackerResult<()> {
        self.latest.insert(pose.key(), *pose);
        self.writes += 1;
        Ok(())
    }
}

/// One JSON object per line.
pub struct JsonLinesPublisher<W: Write> {
    writer: W,
}

impl<W: Write> JsonLinesPublisher<W> {
    pub fn new(writer: W) -> Self {
        Self { writer }
    }

    pub fn into_inner(self) -> W {
        self.writer
    }
}

impl<W: Write> PosePublisher for JsonLinesPublisher<W> {
    fn publish(&mut self, pose: &TagPose) -> TrackerResult<()> {
        serde_json::to_writer(&mut self.writer, pose)
            .map_err(|e| TrackerError::Publish(e.to_string()))?;
        self.writer.write_all(b"\n")?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Timestamp;

    fn pose(id: TagId, x: f64) -> TagPose {
        TagPose {
            id,
            position: [x, 0.0, 1.0],
            timestamp: Timestamp::new(10, 500),
        }
    }

    #[test]
    fn test_board_keeps_latest_per_key() {
        let mut board = PoseBoard::new();
        board.publish(&pose(7, 0.1)).unwrap();
        board.publish(&pose(3, 0.2)).unwrap();
        board.publish(&pose(7, 0.3)).unwrap();

        assert_eq!(board.len(), 2);
        assert_eq!(board.writes(), 3);
        assert_eq!(board.get(7).unwrap().position[0], 0.3);
        assert!(board.keys().any(|k| k == "3"));
    }

    #[test]
    fn test_json_lines_output() {
        let mut publisher = JsonLinesPublisher::new(Vec::new());
        publisher.publish(&pose(7, 0.5)).unwrap();
        publisher.publish(&pose(8, 0.25)).unwrap();

        let text = String::from_utf8(publisher.into_inner()).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines.len(), 2);

        let parsed: TagPose = serde_json::from_str(lines[0]).unwrap();
        assert_eq!(parsed, pose(7, 0.5));
        assert!(lines[1].contains("\"id\":8"));
    }
}
