//! uaserve Event Loop
//!
//! The default [`uaserve_core::EventLoop`] implementation: a single-threaded
//! scheduler over a tokio current-thread runtime with a TCP connection
//! manager for listening and outbound connections. The server only pumps the
//! loop through `run`; no background thread exists, so all callbacks execute
//! on the embedding application's thread.
//!
//! The [`timer`] module is reusable on its own; the simulation loop in
//! `uaserve-harness` schedules with the same [`timer::TimerQueue`] under a
//! manual clock.

mod eventloop;
pub mod tcp;
pub mod timer;

pub use eventloop::TokioEventLoop;
pub use tcp::TcpConnectionManager;
pub use timer::{DueTimer, TimerQueue};
