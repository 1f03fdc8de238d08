pub mod message;
pub mod room;
pub mod user;

pub use message::StoredMessage;
pub use room::RoomId;
pub use user::UserIdentity;
