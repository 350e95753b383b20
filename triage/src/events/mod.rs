//! Outbound notifications
//!
//! ```text
//! ┌──────────────┐     ┌──────────────┐     ┌──────────────────┐
//! │ Orchestrator │────▶│  Event Bus   │────▶│ Notification     │
//! │  (publish)   │     │  (broadcast) │     │ collaborators    │
//! └──────────────┘     └──────┬───────┘     └──────────────────┘
//!                             │
//!                             ▼
//!                      ┌──────────────┐
//!                      │   History    │
//!                      │ (ring buffer)│
//!                      └──────────────┘
//! ```
//!
//! Events are published after the registry mutation they describe has been
//! committed; delivery is fire-and-forget.

pub mod bus;
pub mod history;
pub mod types;

pub use bus::{EventBus, SharedEventBus};
pub use history::{EventHistory, EventStats};
pub use types::TriageEvent;
