pub mod function;
pub mod mapper;

pub use function::ValueFunction;
pub use mapper::{DataMapper, FieldMapping, Mapping, MappingStatistics};
