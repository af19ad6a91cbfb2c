//! Handler trait and middleware composition
//!
//! A route is a terminal handler wrapped by zero or more middlewares. Each
//! middleware is a function from handler to handler; the chain applies them
//! in reverse of the order they were added, so the first added middleware
//! ends up outermost at request time.

use std::future::Future;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Arc;

use hyper::{Request, Response};

use crate::error::GatewayBody;

/// Future returned by every handler.
pub type BoxFuture = Pin<Box<dyn Future<Output = Response<GatewayBody>> + Send>>;

/// A request handler. Errors never escape: they are rendered as HTTP
/// status responses inside `handle`.
pub trait Handler: Send + Sync {
    fn handle(&self, req: Request<GatewayBody>) -> BoxFuture;
}

pub type ArcHandler = Arc<dyn Handler>;

impl<F> Handler for F
where
    F: Fn(Request<GatewayBody>) -> BoxFuture + Send + Sync,
{
    fn handle(&self, req: Request<GatewayBody>) -> BoxFuture {
        (self)(req)
    }
}

/// A middleware wraps a handler and yields a new handler.
pub type Middleware = Box<dyn FnOnce(ArcHandler) -> ArcHandler>;

/// Ordered middleware stack around a terminal handler.
///
/// Middlewares execute outermost-first in the order they were added.
pub struct Chain {
    middlewares: Vec<Middleware>,
}

impl Chain {
    pub fn new() -> Self {
        Self {
            middlewares: Vec::new(),
        }
    }

    pub fn add(&mut self, middleware: Middleware) {
        self.middlewares.push(middleware);
    }

    /// Wrap `terminal` with the registered middlewares.
    pub fn build(self, terminal: ArcHandler) -> ArcHandler {
        let mut handler = terminal;
        for middleware in self.middlewares.into_iter().rev() {
            handler = middleware(handler);
        }
        handler
    }
}

impl Default for Chain {
    fn default() -> Self {
        Self::new()
    }
}

/// Peer address of the client, stashed in request extensions by the server.
#[derive(Debug, Clone, Copy)]
pub struct ClientAddr(pub SocketAddr);

/// Whether the connection arrived over TLS.
#[derive(Debug, Clone, Copy)]
pub struct TlsSession(pub bool);
