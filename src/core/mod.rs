pub mod error;
pub mod types;
pub mod value;

pub use error::{EngineError, EngineResult, ErrorKind, MigrationError, Result};
pub use types::{Column, ForeignKey, IndexDef, ReferentialAction, Row, TableSchema};
pub use value::{DataType, Value};
