//! hookflow - watch-and-notify automation engine
//!
//! hookflow lets an operator define named notification flows that watch an
//! external condition (a timer, a polled API field, or an inbound event)
//! and, when triggered, render a message or rich embed from a template and
//! deliver it to an outbound webhook.
//!
//! ## Key pieces
//!
//! - **Templates**: `{name}`, `{a.b.0}` / `{a['b']['0']}` nested access,
//!   `{$var}` user variables, `{time}`, `{data}`, `{img:...}` image
//!   markers, and `[...]` inline arithmetic. Rendering never raises:
//!   unresolved references degrade to visible sentinels.
//! - **Conditions**: a closed boolean expression grammar used to gate
//!   deliveries; malformed conditions fail closed.
//! - **Scheduler**: a single polling loop with per-flow fault isolation,
//!   change detection against a canonical baseline, and crash-tolerant
//!   persistence that only advances after a confirmed delivery.
//! - **Dispatcher**: webhook payload assembly, embed building with
//!   static/conditional/gradient colors, and multipart image attachments.
//!
//! ## Example flow
//!
//! ```json
//! {
//!   "name": "disk-alert",
//!   "trigger_type": "on_change",
//!   "active": true,
//!   "endpoint": "https://host/api/metrics",
//!   "field": "disk['used_percent']",
//!   "message_template": "Disk usage moved from {old_value}% to {value}%",
//!   "condition_enabled": true,
//!   "condition": "value > 90"
//! }
//! ```

pub mod condition;
pub mod config;
pub mod dispatch;
pub mod embed;
pub mod error;
pub mod flow;
pub mod images;
pub mod notify_log;
pub mod scheduler;
pub mod store;
pub mod template;

pub use error::{Error, Result};
