// Messaging module - change normalization, routing and invalidation coalescing
pub mod coalesce;
pub mod event;
pub mod router;

pub use coalesce::{Coalescer, InvalidationHook};
pub use event::{ChangeEvent, ChangeKind, EventKind, Row, SubscriberEvent};
pub use router::{EventRouter, InvalidationMap, RouteTarget};
