//! # Traffic Control Requests
//!
//! Builders for the rtnetlink messages that make up a node's shaping tree, and helpers that
//! send them over a [`rtnetlink::Handle`].
//!
//! ## Hierarchy
//!
//! Every node's interface carries one HTB tree. Each destination the node has a shaped link
//! to gets its own class, selected by a u32 filter on the destination address. Delay and loss
//! are added by a netem qdisc attached under the class.
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────────┐
//! │                      HTB root qdisc (1:0), defcls 1                  │
//! └──────────────────────────────────────────────────────────────────────┘
//!          │                        │                        │
//!          ▼                        ▼                        ▼
//! ┌──────────────────┐    ┌──────────────────┐    ┌──────────────────┐
//! │  1:1 (default)   │    │  Class 1:2       │    │  Class 1:3       │
//! │  unclassified    │    │  dst = peer A    │    │  dst = peer B    │
//! │  traffic         │    │  rate limited    │    │  rate limited    │
//! └──────────────────┘    └──────────────────┘    └──────────────────┘
//!                                   │                        │
//!                                   ▼                        ▼
//!                         ┌──────────────────┐    ┌──────────────────┐
//!                         │  Netem (2:0)     │    │  Netem (3:0)     │
//!                         │  optional        │    │  optional        │
//!                         └──────────────────┘    └──────────────────┘
//! ```
//!
//! ## Handle Numbering
//!
//! Destinations are numbered by a slot, the count of destinations the node already had when
//! the new one was classified. Slots are never reused since destinations are never removed.
//!
//! | Component        | Handle         | Example (slot 0) |
//! |------------------|----------------|------------------|
//! | HTB root         | `1:0`          | `N/A`            |
//! | Default class    | `1:1`          | `N/A`            |
//! | Per-dest class   | `1:(slot+2)`   | `1:2`            |
//! | Netem qdisc      | `(slot+2):0`   | `2:0`            |
//!
//! ## Packet Flow
//!
//! 1. Packet enters the HTB root qdisc.
//! 2. u32 filters (priority 1) compare the IPv4 destination address at offset 16.
//! 3. On a match the packet is queued in that destination's class, otherwise in `1:1`.
//! 4. The class enforces the configured rate; its netem child, if any, applies delay and loss.

pub mod core;
pub mod filter;
pub mod handle;
pub mod htb;
pub mod netem;
pub mod nla;
pub mod requests;
