//! Worker pools and the primitives they are built from.
//!
//! All waiting in this crate happens on OS primitives; callers block on a
//! [`async_handle::WaitHandle`] until a worker signals completion.

pub mod async_handle;
pub mod pool;
pub mod request_worker;
pub mod work_item;
pub mod work_item_queue;
pub mod worker;
