//! `sqlmq` turns an ordinary SQL database (MySQL or Postgres) into a
//! multi-producer / multi-consumer work queue with at-least-once delivery.
//!
//! Producers coalesce pushed payloads into batched INSERTs; consumers claim
//! ready rows under `FOR UPDATE SKIP LOCKED` inside short transactions, so
//! any number of workers, in any number of processes sharing the database,
//! pull distinct messages without blocking each other. Successful
//! processing acks by deleting the row; failures are requeued with a linear
//! backoff until the retry budget is spent.
//!
//! ```no_run
//! use sqlmq::{Client, ConsumerOptions, ProducerOptions};
//! use tokio_util::sync::CancellationToken;
//!
//! # async fn run() -> sqlmq::QueueResult<()> {
//! let client = Client::connect("postgres", "postgres://localhost/queue").await?;
//! let cancel = CancellationToken::new();
//!
//! let producer = client
//!     .producer(cancel.clone(), ProducerOptions::default())
//!     .await?;
//! let _consumer = client
//!     .consumer(
//!         cancel.clone(),
//!         |payload| {
//!             println!("got {} bytes", payload.len());
//!             Ok(())
//!         },
//!         ConsumerOptions::default(),
//!     )
//!     .await?;
//!
//! producer.push(b"hello".to_vec()).await;
//! # Ok(())
//! # }
//! ```

pub mod client;
pub mod consumer;
pub mod db;
pub mod error;
pub mod producer;

pub use client::*;
pub use consumer::*;
pub use db::*;
pub use error::*;
pub use producer::*;

#[cfg(test)]
mod tests;
