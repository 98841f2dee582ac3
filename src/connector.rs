//! C1: produces one raw database connection on demand.
//!
//! Grounded on `sqlx-core/src/pool/connect.rs`'s `PoolConnector` trait: a
//! small async trait plus a metadata struct describing the attempt. This
//! crate keeps the metadata but drops `PoolConnector`'s exponential-backoff
//! `connect_with_control_flow` — the spec calls for a fixed retry delay,
//! applied by [`crate::factory::ConnectionFactory`], not by the connector
//! itself.

use std::future::Future;
use std::time::Instant;

use crate::error::Error;
use crate::raw::RawConnection;

/// Metadata passed to every [`Connector::connect`] attempt.
#[derive(Debug, Clone)]
pub struct ConnectMeta {
    pub start: Instant,
    pub attempt: u32,
    /// A caller-supplied `{user, password}` overriding the connector's own
    /// default identity for this one connection (spec §4.1c). Honored by
    /// [`ExternalConnector`]; [`UrlConnector`] and plain closures keep
    /// whatever identity they were built with, since per-call credential
    /// routing beyond this single override is out of scope (spec Non-goals).
    pub credentials: Option<(String, String)>,
}

/// Produces one raw connection. Implementations typically wrap a driver's
/// own connect routine; this crate treats that routine as an external
/// collaborator (spec §1) and only defines the contract.
pub trait Connector: Send + Sync + 'static {
    type Connection: RawConnection;

    fn connect(
        &self,
        meta: ConnectMeta,
    ) -> impl Future<Output = Result<Self::Connection, Error>> + Send + '_;
}

impl<F, Fut, C> Connector for F
where
    F: Fn(ConnectMeta) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<C, Error>> + Send + 'static,
    C: RawConnection,
{
    type Connection = C;

    fn connect(
        &self,
        meta: ConnectMeta,
    ) -> impl Future<Output = Result<Self::Connection, Error>> + Send + '_ {
        self(meta)
    }
}

/// Driver-with-credentials variant (spec §4.1a): a URL plus `{user, password}`
/// merged over configured driver properties.
pub struct UrlConnector<C, F> {
    pub url: String,
    pub user: Option<String>,
    pub password: Option<String>,
    pub properties: Vec<(String, String)>,
    connect_fn: F,
    _marker: std::marker::PhantomData<fn() -> C>,
}

impl<C, F, Fut> UrlConnector<C, F>
where
    F: Fn(String, Vec<(String, String)>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<C, Error>> + Send + 'static,
    C: RawConnection,
{
    pub fn new(url: impl Into<String>, connect_fn: F) -> Self {
        Self {
            url: url.into(),
            user: None,
            password: None,
            properties: Vec::new(),
            connect_fn,
            _marker: std::marker::PhantomData,
        }
    }

    pub fn credentials(mut self, user: impl Into<String>, password: impl Into<String>) -> Self {
        self.user = Some(user.into());
        self.password = Some(password.into());
        self
    }

    pub fn property(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.properties.push((key.into(), value.into()));
        self
    }

    fn merged_properties(&self) -> Vec<(String, String)> {
        let mut props = self.properties.clone();
        if let Some(u) = &self.user {
            props.push(("user".into(), u.clone()));
        }
        if let Some(p) = &self.password {
            props.push(("password".into(), p.clone()));
        }
        props
    }
}

impl<C, F, Fut> Connector for UrlConnector<C, F>
where
    F: Fn(String, Vec<(String, String)>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<C, Error>> + Send + 'static,
    C: RawConnection,
{
    type Connection = C;

    fn connect(
        &self,
        _meta: ConnectMeta,
    ) -> impl Future<Output = Result<Self::Connection, Error>> + Send + '_ {
        (self.connect_fn)(self.url.clone(), self.merged_properties())
    }
}

/// External-data-source variants (spec §4.1b/c): either default credentials
/// or an explicit `{user, password}` pair supplied per call.
pub struct ExternalConnector<F> {
    user: Option<String>,
    password: Option<String>,
    connect_fn: F,
}

impl<C, F, Fut> ExternalConnector<F>
where
    F: Fn(Option<&str>, Option<&str>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<C, Error>> + Send + 'static,
    C: RawConnection,
{
    /// Default credentials.
    pub fn new(connect_fn: F) -> Self {
        Self {
            user: None,
            password: None,
            connect_fn,
        }
    }

    /// Explicit `{user, password}` for a single raw connection.
    pub fn with_credentials(
        connect_fn: F,
        user: impl Into<String>,
        password: impl Into<String>,
    ) -> Self {
        Self {
            user: Some(user.into()),
            password: Some(password.into()),
            connect_fn,
        }
    }
}

impl<C, F, Fut> Connector for ExternalConnector<F>
where
    F: Fn(Option<&str>, Option<&str>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<C, Error>> + Send + 'static,
    C: RawConnection,
{
    type Connection = C;

    fn connect(
        &self,
        meta: ConnectMeta,
    ) -> impl Future<Output = Result<Self::Connection, Error>> + Send + '_ {
        let (user, password) = match &meta.credentials {
            Some((u, p)) => (Some(u.clone()), Some(p.clone())),
            None => (self.user.clone(), self.password.clone()),
        };
        (self.connect_fn)(user.as_deref(), password.as_deref())
    }
}
