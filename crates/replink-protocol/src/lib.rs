//! replink protocol - bencode wire format for the dev-runtime REPL
//!
//! This crate provides the message type, the canonical bencode encoder, the
//! streaming frame decoder, and the typed request builders shared by the
//! client and the command-line front end.
//!
//! All code follows the panic-free policy: no `.unwrap()`, `.expect()`,
//! `panic!()`, `unreachable!()`, `todo!()`, or unchecked indexing.

pub mod bencode;
pub mod codec;
pub mod listing;
pub mod message;
pub mod ops;

pub use bencode::{decode, encode, parse_frame, resume_frame, FrameStatus, PartialFrame};
pub use codec::{BencodeCodec, ProtocolError, MAX_FRAME_SIZE};
pub use listing::{parse_bean_listing, parse_snapshot_listing, BeanInfo};
pub use message::{fields, Message};
pub use ops::{advertised_ops, new_request_id, Op, Request};
