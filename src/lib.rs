//! # docgraph
//!
//! Question answering over collections of documents.
//!
//! Each uploaded document gets its own retrieval index and a short summary.
//! The indices of a batch are composed into a collection (a composite router)
//! that a tool-using agent queries on behalf of the user, one tool per
//! document plus one that routes automatically.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────┐   ┌─────────────┐   ┌──────────────┐   ┌────────────┐
//! │ Uploads  │──▶│  Extract +  │──▶│ Index + Sum- │──▶│ Collection │
//! │ PDF/text │   │    Chunk    │   │    mary      │   │  (router)  │
//! └──────────┘   └─────────────┘   └──────────────┘   └─────┬──────┘
//!                                                           │
//!                                 ┌─────────────────────────┤
//!                                 ▼                         ▼
//!                           ┌──────────┐             ┌────────────┐
//!                           │  Agent   │◀───────────▶│ Session    │
//!                           │ executor │             │ history    │
//!                           └────┬─────┘             └────────────┘
//!                     ┌──────────┴──────────┐
//!                     ▼                     ▼
//!               ┌──────────┐          ┌──────────┐
//!               │   CLI    │          │   HTTP   │
//!               └──────────┘          └──────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```bash
//! docgraph init
//! docgraph index ./reports --collection q3
//! docgraph ask --collection q3 "What changed in revenue?"
//! docgraph serve
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing |
//! | [`error`] | Typed error taxonomy |
//! | [`models`] | Core data types |
//! | [`extract`] | PDF and text extraction |
//! | [`chunk`] | Overlapping fixed-window chunking |
//! | [`embedding`] | Embedding provider abstraction |
//! | [`llm`] | Chat model abstraction |
//! | [`index`] | Per-document vector index and indexer |
//! | [`store`] | Named JSON storage for indices and collections |
//! | [`router`] | Composite router, rankers, tool table |
//! | [`agent`] | Tool-using reasoning loop |
//! | [`session`] | Conversation history and agent memory |
//! | [`progress`] | Indexing progress reporting |
//! | [`app`] | Application state and operations |
//! | [`server`] | HTTP API |

pub mod agent;
pub mod app;
pub mod chunk;
pub mod config;
pub mod embedding;
pub mod error;
pub mod extract;
mod http;
pub mod index;
pub mod llm;
pub mod models;
pub mod progress;
pub mod router;
pub mod server;
pub mod session;
pub mod store;
