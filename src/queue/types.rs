use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Scheduling priority; lower values are served first.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    Critical = 1,
    High = 2,
    #[default]
    Normal = 5,
    Low = 8,
    Background = 10,
}

impl Priority {
    pub fn value(self) -> u8 {
        self as u8
    }

    /// Maps any value onto the nearest level at or below it.
    pub fn from_value(value: u8) -> Self {
        match value {
            0..=1 => Priority::Critical,
            2..=4 => Priority::High,
            5..=7 => Priority::Normal,
            8..=9 => Priority::Low,
            _ => Priority::Background,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    Upload,
    Download,
}

impl Direction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Direction::Upload => "upload",
            Direction::Download => "download",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "upload" => Some(Direction::Upload),
            "download" => Some(Direction::Download),
            _ => None,
        }
    }

    /// The state an item of this direction is in while a worker owns it.
    pub fn active_state(&self) -> QueueState {
        match self {
            Direction::Upload => QueueState::Uploading,
            Direction::Download => QueueState::Downloading,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityType {
    File,
    Folder,
}

impl EntityType {
    pub fn as_str(&self) -> &'static str {
        match self {
            EntityType::File => "file",
            EntityType::Folder => "folder",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "file" => Some(EntityType::File),
            "folder" => Some(EntityType::Folder),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueueState {
    Queued,
    Uploading,
    Downloading,
    Completed,
    Failed,
    Paused,
    Cancelled,
}

impl QueueState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            QueueState::Completed | QueueState::Failed | QueueState::Cancelled
        )
    }

    pub fn is_active(&self) -> bool {
        matches!(self, QueueState::Uploading | QueueState::Downloading)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            QueueState::Queued => "queued",
            QueueState::Uploading => "uploading",
            QueueState::Downloading => "downloading",
            QueueState::Completed => "completed",
            QueueState::Failed => "failed",
            QueueState::Paused => "paused",
            QueueState::Cancelled => "cancelled",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "queued" => Some(QueueState::Queued),
            "uploading" => Some(QueueState::Uploading),
            "downloading" => Some(QueueState::Downloading),
            "completed" => Some(QueueState::Completed),
            "failed" => Some(QueueState::Failed),
            "paused" => Some(QueueState::Paused),
            "cancelled" => Some(QueueState::Cancelled),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueItem {
    pub queue_id: String,
    pub entity_id: String,
    pub entity_type: EntityType,
    pub direction: Direction,
    pub priority: Priority,
    /// Percent complete, 0 to 100.
    pub progress: f32,
    pub state: QueueState,
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl QueueItem {
    pub fn new(
        entity_id: impl Into<String>,
        entity_type: EntityType,
        direction: Direction,
        priority: Priority,
    ) -> Self {
        let now = Utc::now();
        Self {
            queue_id: Uuid::new_v4().to_string(),
            entity_id: entity_id.into(),
            entity_type,
            direction,
            priority,
            progress: 0.0,
            state: QueueState::Queued,
            error_message: None,
            created_at: now,
            updated_at: now,
            started_at: None,
            completed_at: None,
        }
    }

    pub(crate) fn transition(&mut self, to: QueueState) {
        let now = Utc::now();
        if to.is_active() && self.started_at.is_none() {
            self.started_at = Some(now);
        }
        if to.is_terminal() {
            self.completed_at = Some(now);
        }
        self.state = to;
        self.updated_at = now;
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct QueueStats {
    pub queued: usize,
    pub active: usize,
    pub paused: usize,
    pub completed: usize,
    pub failed: usize,
    pub cancelled: usize,
}

impl QueueStats {
    pub fn total(&self) -> usize {
        self.queued + self.active + self.paused + self.completed + self.failed + self.cancelled
    }

    pub fn unfinished(&self) -> usize {
        self.queued + self.active + self.paused
    }
}
