//! C8: the JDBC-style proxy layer (spec §4.8) applications actually touch —
//! `ConnectionProxy`, `StatementProxy`, `ResultSetProxy`. Each intercepts its
//! raw counterpart's calls to fire the matching hook and enforce the
//! closed-state machine described in spec §3/§4.8.

mod connection;
mod result_set;
mod statement;

pub use connection::ConnectionProxy;
pub use result_set::ResultSetProxy;
pub use statement::StatementProxy;
