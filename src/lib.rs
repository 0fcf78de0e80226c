#![warn(rust_2018_idioms)]

//! A general-purpose incremental, demand-driven query engine.
//!
//! Clients register [`Handler`]s for their own [`Query`] types; the engine
//! memoizes each query's result in a [`Graph`], tracks the dependencies a
//! handler discovers while it runs, and re-evaluates only the part of the
//! graph a later change actually touches. A [`Serializer`] can persist and
//! reload the memo table across process restarts.
//!
//! ```no_run
//! use flowquery::{EngineBuilder, EvalContext, Handler, Query};
//! use async_trait::async_trait;
//!
//! #[derive(Clone, Debug, PartialEq, Eq, Hash)]
//! struct FileContents(String);
//! impl Query for FileContents {
//!     type Value = String;
//! }
//!
//! struct FileReader;
//! #[async_trait]
//! impl Handler<FileContents> for FileReader {
//!     async fn handle(
//!         &self,
//!         query: &FileContents,
//!         _ctx: &EvalContext<'_>,
//!     ) -> Result<String, flowquery::HandlerError> {
//!         std::fs::read_to_string(&query.0).map_err(flowquery::HandlerError::new)
//!     }
//! }
//!
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let engine = EngineBuilder::new()
//!     .with_handler::<FileContents, _>(FileReader)?
//!     .build();
//! let contents = engine.evaluate(FileContents("Cargo.toml".into())).await?;
//! println!("{}", contents);
//! # Ok(())
//! # }
//! ```

mod debug;
mod engine;
mod error;
mod graph;
mod handler;
mod observable;
mod query;
mod serializer;
mod util;
mod validity;

pub use crate::debug::GraphPrinter;
pub use crate::engine::QueryEngine;
pub use crate::error::{EngineError, HandlerError};
pub use crate::graph::Graph;
pub use crate::handler::{Canonical, EngineBuilder, EvalContext, Handler};
pub use crate::observable::{ChangeStream, ChangeSubscription, Observable};
pub use crate::query::{Query, QueryId};
pub use crate::serializer::{Dump, Encoded, Entry, Serializer};
pub use crate::validity::Validity;
