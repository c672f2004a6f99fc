use std::thread;

/// Spawns a thread with a readable name. Every subsystem driver gets one;
/// the name shows up in panic messages and debuggers.
pub fn spawn_named_thread<F, T>(name: impl Into<String>, f: F) -> thread::JoinHandle<T>
where
    F: FnOnce() -> T + Send + 'static,
    T: Send + 'static,
{
    thread::Builder::new()
        .name(name.into())
        .spawn(f)
        .expect("thread name should be valid")
}
