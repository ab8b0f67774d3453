pub mod eval;
pub mod expand;

pub use eval::{eval_body, eval_expr, eval_repetition, EvalData, Repetition, Scope};
pub use expand::{ExpandedKeys, Expander, Expansion};
