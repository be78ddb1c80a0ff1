//! Fan-out delivery pipeline for web push.
//!
//! A send request becomes one background dispatch run. The run streams the
//! audience from storage, routes Web Push subscriptions to provider queues,
//! hands device tokens to the push transport, and records the outcomes as
//! events and hourly stats.

pub mod dispatcher;
pub mod error;
pub mod personalize;
pub mod queue;
pub mod recorder;
pub mod router;
pub mod service;
pub mod source;
pub mod stats;
pub mod tracking;
pub mod transport;

pub use dispatcher::{
    BatchDispatcher, DEFAULT_PROCESS_BATCH_SIZE, DispatchRequest, DispatchSettings,
    DispatchSummary,
};
pub use error::NotificationError;
pub use personalize::{FieldReplacements, Personalization, personalize};
pub use queue::{
    BackgroundQueue, BackgroundWorkQueue, DEFAULT_WORK_QUEUE_CAPACITY, InlineWorkQueue, WorkItem,
    work_item,
};
pub use recorder::EventRecorder;
pub use router::{DEFAULT_QUEUE_NAME, ProviderRouter};
pub use service::{NewPushMessage, PushService, QueuedPushService};
pub use source::{
    DEFAULT_CURSOR_BATCH_SIZE, PagedSubscriberSource, SubscriberSource, SubscriptionStream,
};
pub use stats::{StatsAggregator, aggregate};
pub use tracking::{CallbackUrls, TrackingCodec, TrackingError, TrackingUrls};
pub use transport::{PushTransport, QueuePublisher, WebPushEnvelope};
