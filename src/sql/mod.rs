pub mod batch;
pub mod serializer;

pub use batch::{batch_transaction, ApplyPlan, SqlBatch, BEGIN_MARKER, COMMIT_MARKER};
pub use serializer::{NumericLiteralPolicy, SqlSerializer, TypeClass};
