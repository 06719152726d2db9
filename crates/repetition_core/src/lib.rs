pub mod clock;
pub mod digest;
pub mod domain;
pub mod effects;
pub mod error;
pub mod ports;
pub mod scheduler;
pub mod selection;

#[cfg(test)]
mod testing;

pub use clock::{Clock, MockClock, SystemClock};
pub use digest::DigestBuilder;
pub use domain::{
    Account, AgeTier, BookDomain, BookScope, Digest, NewDigest, Note, NotificationType,
    RepetitionRule, RuleError, User,
};
pub use error::ProcessError;
pub use ports::{NotificationGateway, PortError, PortResult, RuleStore, UnitOfWork};
pub use scheduler::{
    NotificationStatus, RuleOutcome, SchedulerCore, SchedulerSettings, SkipReason, TickReport,
};
pub use selection::{BalancedSelection, NoteSelectionPolicy};
