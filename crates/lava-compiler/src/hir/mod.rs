//! Sea-of-nodes HIR: graph storage (§3.4/§4.4) plus the bytecode-driven
//! graph builder (§4.3).

mod builder;
mod node;

pub use builder::{build_function, build_function_osr};
pub use node::{BarrierKind, BinaryKind, Graph, MergeKind, Node, NodeId, NodeKind, TypeKind, UnaryKind};
