//! A post office is where a machine's mail is kept. Assume a task on machine A wants to
//! hand a message to a task on machine B. Since the network loses packets and the
//! recipient may not be listening yet, the message is put into a numbered mailbox in
//! B's post office, where it waits until someone takes it out. When the sender needs
//! to know the message arrived, the post office keeps it pending and sends it again
//! until the recipient acknowledges it.
//!

mod model;
pub use model::*;

mod dispatcher;

mod pending;
pub use pending::*;

mod reliable;
pub use reliable::RECENTLY_COMPLETED;
