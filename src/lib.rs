//! Looper - deterministic virtual-time scheduling for platform test doubles
//!
//! This library lets code written against a platform run loop (post now,
//! post after a delay, post to the front of the queue) execute inside an
//! ordinary test process, with the test in full control of when posted work
//! actually runs:
//! - [`scheduler`]: the virtual clock and ordered task queue
//! - [`dispatcher`]: per-thread run loops and the registry that resolves them
//! - [`endpoint`]: the posting handles collaborators hold
//!
//! ```
//! use looper::{DispatcherRegistry, Endpoint, Runnable};
//! use std::sync::{Arc, Mutex};
//!
//! let registry = DispatcherRegistry::default();
//! let endpoint = Endpoint::new(registry.main());
//! let log = Arc::new(Mutex::new(Vec::new()));
//!
//! registry.main().pause();
//! let sink = Arc::clone(&log);
//! endpoint
//!     .post_delayed(Runnable::new(move || sink.lock().unwrap().push("tick")), 100)
//!     .unwrap();
//! assert!(log.lock().unwrap().is_empty());
//!
//! registry.main().idle_for(100);
//! assert_eq!(*log.lock().unwrap(), vec!["tick"]);
//! ```

#![forbid(unsafe_code)]
#![cfg_attr(
    test,
    allow(
        clippy::unwrap_used,
        clippy::significant_drop_tightening,
        clippy::items_after_statements
    )
)]
#![allow(clippy::must_use_candidate, clippy::doc_markdown)]

pub mod config;
pub mod dispatcher;
pub mod endpoint;
pub mod error;
pub mod scheduler;

pub use config::{NegativeDelayPolicy, SchedulerConfig};
pub use dispatcher::{Dispatcher, DispatcherRegistry};
pub use endpoint::{Endpoint, Message, MessageCallback, MessageHandler};
pub use error::{Error, Result};
pub use scheduler::{IdleState, Placement, Runnable, ScheduledTask, Scheduler, Seq};
