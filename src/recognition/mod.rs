//! Recognition session: engine lifecycle, user-visible status and results

mod controller;
mod result;
mod session;
mod status;

pub use controller::{ControllerError, ControllerOptions, HostServices, RecognitionController};
pub use result::{count_words, RecognitionResult};
pub use session::SessionState;
pub use status::{ClipboardOutcome, Status, CANCELLED_TEXT, EXPIRED_TEXT};
