mod mailbox;

pub use mailbox::{Closed, Mailbox};
