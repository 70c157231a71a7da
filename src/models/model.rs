//! Local id generation and the macro that stamps the common `SyncEntity`
//! plumbing onto our model structs.
//!
//! Local ids look like `<ms timestamp hex (12)><client id (8)><counter (8)>`,
//! which sorts roughly by creation time and won't collide between two
//! processes writing into the same store.

use std::sync::RwLock;

use crate::util;

lazy_static! {
    /// create a static/global cid counter
    static ref CID_COUNTER: RwLock<u32> = RwLock::new(0);

    /// holds our app's client id
    static ref CLIENT_ID: RwLock<Option<String>> = RwLock::new(None);
}

/// Get the model system's client id, generating one if we haven't yet
pub fn get_client_id() -> String {
    {
        let guard = lockr!(*CLIENT_ID);
        if let Some(ref id) = *guard {
            return id.clone();
        }
    }
    let mut guard = lockw!(*CLIENT_ID);
    // somebody may have beaten us here between the locks
    if let Some(ref id) = *guard {
        return id.clone();
    }
    let seed = (std::process::id() as u64) ^ (util::now_ms() as u64);
    let id = format!("{:08x}", (seed & 0xffff_ffff) as u32);
    debug!("model -- get_client_id(): generated {}", id);
    *guard = Some(id.clone());
    id
}

/// Set the model system's client id
pub fn set_client_id(id: String) {
    debug!("model -- set_client_id(): {}", id);
    let mut guard = lockw!(*CLIENT_ID);
    *guard = Some(id);
}

/// Create a new local id
pub fn cid() -> String {
    let client_id = get_client_id();
    let counter = {
        let mut counter_guard = lockw!(*CID_COUNTER);
        let counter: u32 = *counter_guard;
        *counter_guard = counter.wrapping_add(1);
        counter
    };
    format!("{:012x}{}{:08x}", util::now_ms(), client_id, counter)
}

/// Implements the boilerplate half of `SyncEntity` for a model struct that has
/// `local_id`, `guid`, `usn` and `dirty` fields. Anything extra gets passed
/// through into the impl block.
#[macro_export]
macro_rules! make_sync_entity {
    ($n:ty, $ty:expr) => {
        make_sync_entity!{ $n, $ty, }
    };

    ($n:ty, $ty:expr, $( $extra:tt )*) => {
        impl $crate::models::SyncEntity for $n {
            fn entity_type() -> $crate::models::EntityType {
                $ty
            }

            fn local_id(&self) -> &str {
                &self.local_id
            }

            fn set_local_id(&mut self, id: String) {
                self.local_id = id;
            }

            fn guid(&self) -> Option<&str> {
                self.guid.as_ref().map(|x| x.as_str())
            }

            fn set_guid(&mut self, guid: Option<String>) {
                self.guid = guid;
            }

            fn usn(&self) -> Option<i32> {
                self.usn
            }

            fn set_usn(&mut self, usn: Option<i32>) {
                self.usn = usn;
            }

            fn is_dirty(&self) -> bool {
                self.dirty
            }

            fn set_dirty(&mut self, dirty: bool) {
                self.dirty = dirty;
            }

            $( $extra )*
        }
    };
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cids_are_unique_and_sized() {
        let id1 = cid();
        let id2 = cid();
        assert_eq!(id1.len(), 28);
        assert_ne!(id1, id2);
        assert_eq!(&id1[12..20], &get_client_id()[..]);
    }
}
