#![forbid(unsafe_code)]

//! `vibur` is an async connection pool generic over a caller-supplied raw
//! connection type, grounded on `sqlx-core`'s `pool` module. It implements
//! the borrow/restore protocol with a fair or unfair wait queue, a
//! versioned connection factory that rolls over its whole generation on a
//! critical SQLSTATE, a background idle-size reducer, a pool-wide bounded
//! prepared-statement cache, and a JDBC-shaped proxy layer
//! (`Connection`/`Statement`/`ResultSet`) applications hold instead of the
//! raw connection directly.
//!
//! The typical shape of use:
//!
//! ```ignore
//! let ds = DataSource::new(my_connector, PoolConfig::builder().build()?);
//! ds.start().await?;
//! let mut conn = ds.get_connection(None).await?;
//! let mut stmt = conn.prepare_statement("select 1").await?;
//! let mut rs = conn.execute(&mut stmt, &[]).await?;
//! while rs.next().await? { /* ... */ }
//! rs.close().await?;
//! conn.close_statement(stmt).await?;
//! conn.close().await?;
//! ```

pub mod config;
pub mod connector;
pub mod datasource;
pub mod error;
mod factory;
mod holder;
pub mod hooks;
mod operations;
mod pool;
pub mod proxy;
mod raw;
mod reducer;
mod statement_cache;

pub use config::{ConfigBuilder, IsolationLevel, PoolConfig};
pub use connector::{ConnectMeta, Connector, ExternalConnector, UrlConnector};
pub use datasource::DataSource;
pub use error::{DatabaseError, Error, PoolError, Result};
pub use holder::{ConnectionId, TakenConnectionInfo};
pub use raw::{RawConnection, RawResultSet};
