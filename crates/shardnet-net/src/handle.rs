use std::sync::atomic::{AtomicU64, Ordering};

/// Manager/connection/listener references are explicit handles over a generation
/// counter rather than `Arc` cycles: the manager owns
/// connections and listeners by id; a `Connection`/`Listener` handle refers back to
/// the manager only by id, never by strong reference.
macro_rules! handle_type {
    ($name:ident, $counter:ident) => {
        #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
        pub struct $name(u64);

        static $counter: AtomicU64 = AtomicU64::new(1);

        impl $name {
            pub(crate) fn next() -> Self {
                Self($counter.fetch_add(1, Ordering::Relaxed))
            }

            pub fn as_u64(self) -> u64 {
                self.0
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                write!(f, "{}({})", stringify!($name), self.0)
            }
        }
    };
}

handle_type!(ConnectionId, NEXT_CONNECTION_ID);
handle_type!(ListenerId, NEXT_LISTENER_ID);
