mod mutex;

pub use mutex::Mutex;
