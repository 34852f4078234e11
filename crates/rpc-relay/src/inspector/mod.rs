//! Inspector panel model: session, capture buffer, search and view.

pub mod buffer;
pub mod search;
pub mod session;
pub mod view;

pub use buffer::{CaptureBuffer, CaptureEntry, Insertion};
pub use search::{Match, SearchEngine, Section};
pub use session::{CaptureSwitch, InspectorSession, PanelInput, SessionFault, SessionState};
pub use view::{project, ViewModel};
