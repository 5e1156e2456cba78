//! Data layer: event tables, loading/writing, and row filtering.
//!
//! Architecture:
//! ```text
//!  .parquet / .json / .csv
//!        │
//!        ▼
//!   ┌──────────┐
//!   │  loader   │  parse file → EventTable
//!   └──────────┘
//!        │
//!        ▼
//!   ┌────────────┐
//!   │ EventTable │  channel columns + condition columns
//!   └────────────┘
//!        │
//!        ▼
//!   ┌──────────┐
//!   │  filter   │  mesh-domain bounds, control subsets → kept row indices
//!   └──────────┘
//!        │
//!        ▼
//!   ┌──────────┐
//!   │  writer   │  EventTable → file
//!   └──────────┘
//! ```

pub mod filter;
pub mod loader;
pub mod model;
pub mod writer;
