mod hash;
mod router;

pub use hash::{unsalted_hash64, Xxh3Hash64};
pub use router::{Node, RendezvousRouter};
