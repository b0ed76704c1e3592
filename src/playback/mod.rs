//! Playback engine: sequences, timed dispatch and session bookkeeping

pub mod feed;
pub mod player;
pub mod registry;
pub mod scheduler;
pub mod sequence;

pub use feed::{PlaybackFeed, PlaybackNotice};
pub use player::{PlaybackState, SequencePlayer, SessionStatus};
pub use registry::{SessionEntry, SessionRegistry, SessionSource, SessionSummary};
pub use scheduler::{DispatchStats, Scheduler, SchedulerStatus};
pub use sequence::Sequence;
