use crate::core::Core;
use std::{sync::Arc, thread::JoinHandle};

/// A thread-backed service bound to a [`Core`].
///
/// `start` spawns the service workers and returns their handles, `stop`
/// signals them to exit. `stop` must not block on the workers themselves,
/// [`Core::run`] joins them.
pub trait Service: Send + Sync {
    fn ident(self: Arc<Self>) -> &'static str;
    fn start(self: Arc<Self>, core: Arc<Core>) -> Vec<JoinHandle<()>>;
    fn stop(self: Arc<Self>);
}
