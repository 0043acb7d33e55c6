#![deny(missing_docs, missing_debug_implementations)]

//! A cooperative AMQP 1.0 messenger endpoint based on serde and mio.
//!
//! A [`Messenger`] multiplexes many AMQP 1.0 conversations through one
//! user-visible endpoint. Peers and nodes are named by URI; connections,
//! sessions and links are established lazily and reused, messages are
//! transferred with delivery tracking through bounded-window queues, and
//! all I/O is driven cooperatively from the calling thread; the only
//! suspension point is a bounded readiness poll.
//!
//! # Quick start
//!
//! ```rust,no_run
//! use hematite_messenger::{Message, Messenger};
//! use serde_amqp::Value;
//!
//! fn main() -> Result<(), hematite_messenger::Error> {
//!     let mut messenger = Messenger::builder()
//!         .name("example")
//!         .timeout(5_000)
//!         .outgoing_window(1024)
//!         .build();
//!     messenger.start()?;
//!
//!     let mut message = Message::new();
//!     message.set_address("amqp://127.0.0.1:5672/q1");
//!     message.set_body(Value::String(String::from("hello AMQP")));
//!
//!     messenger.put(message)?;
//!     messenger.send()?;
//!     messenger.stop()?;
//!     Ok(())
//! }
//! ```
//!
//! Receiving mirrors the sending side:
//!
//! ```rust,no_run
//! # use hematite_messenger::Messenger;
//! # fn main() -> Result<(), hematite_messenger::Error> {
//! let mut messenger = Messenger::builder().name("receiver").timeout(5_000).build();
//! messenger.start()?;
//! // A source containing `~` binds a listener instead of attaching a
//! // receiving link to a remote peer.
//! messenger.subscribe("amqp://~0.0.0.0:5672")?;
//! messenger.recv(1)?;
//! if let Some(message) = messenger.get()? {
//!     println!("{:?}", message.body);
//! }
//! # messenger.stop()?;
//! # Ok(())
//! # }
//! ```

use bytes::Bytes;

pub(crate) mod driver;
pub(crate) mod engine;
pub(crate) mod frames;
pub(crate) mod sasl;
pub(crate) mod transport;

pub mod error;
pub mod message;
pub mod messenger;

pub use error::Error;
pub use message::{Body, Message};
pub use messenger::{Builder, Messenger, Status, Tracker};

/// Opaque payload of a transfer frame
pub(crate) type Payload = Bytes;
