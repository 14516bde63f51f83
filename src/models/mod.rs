//! Data models for the mirror database.
//!
//! These models represent the entities stored in the local SQLite database.
//! All models derive Serialize/Deserialize and FromRow for SQLx queries.

pub mod asset;
pub mod character;
pub mod killmail;

// Re-exports for convenient access
pub use asset::CharacterAsset;
pub use character::TrackedCharacter;
pub use killmail::{KillmailAttacker, KillmailDetail, KillmailVictim, NewAttacker, VictimItem};
