//! Job authoring and dispatch
//!
//! Jobs implement [`crate::Job`], are registered in a [`JobRegistry`] and
//! dispatched through the [`crate::QueueManager`]:
//!
//! ```rust,ignore
//! registry.register::<SendWelcomeEmail>().await?;
//!
//! SendWelcomeEmail { user_id: 42 }
//!     .dispatch(&manager)
//!     .delay_for(Duration::from_secs(60))
//!     .send()
//!     .await?;
//! ```

mod context;
mod dispatcher;
mod handle;
mod payload;
mod registry;

pub use context::JobContext;
pub use dispatcher::{Dispatcher, JobExt};
pub use handle::JobHandle;
pub use payload::{DispatchPayload, JobPayload, PAYLOAD_VERSION};
pub use registry::{JobRegistry, RetryPolicy};

pub(crate) use registry::ErasedJob;
