//! MIT License
//!
//! Copyright (c) 2026 Fei Wang
//!
//! 阻塞原语
//!
//! 等待队列是基础，信号量、条件对象、futex 都建在它上面。
//! 短临界区用 spin 锁（自动禁抢占由持有者自律保证），可睡眠
//! 的互斥语义由信号量提供。

pub mod condition;
pub mod futex;
pub mod semaphore;
pub mod waitq;
