//! Local mirrors of upstream repositories and their synchronisation.

pub mod layout;
pub mod record;
pub mod staleness;
pub mod store;
pub mod sync;

#[cfg(test)]
pub(crate) mod testing;

pub use record::{MirrorKey, MirrorState};
pub use staleness::MaxAgePolicy;
pub use store::{MirrorListing, MirrorStore, SyncFailed};
pub use sync::SyncEngine;
