mod selector;

pub use selector::{RouteMatch, Router};
