pub mod hub;

pub use hub::{EventSink, RoomPresenceHub};
