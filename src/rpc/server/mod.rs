//! Handlers for incoming requests.

mod store;
mod tokens;

use std::collections::HashMap;
use std::fmt::{self, Debug, Formatter};
use std::net::SocketAddr;
use std::num::NonZeroUsize;
use std::time::Instant;

use bytes::Bytes;
use serde::de::DeserializeOwned;
use tracing::debug;

use crate::common::{
    messages::{
        Dict, FindNodeArguments, FindNodeResponse, FindValueArguments, FindValueResponse,
        GetValueArguments, GetValueResponse, PingResponse, StoreValueArguments,
        StoreValueResponse, FIND_NODE, FIND_VALUE, GET_VALUE, PING, STORE_VALUE,
    },
    ErrorSpecific, Id, RequestSpecific, Routing, MAX_BUCKET_SIZE_K,
};
use crate::{Error, Result};

use super::session::HandlerError;

pub use store::ValueStore;
pub use tokens::{Tokens, TOKEN_ROTATE_INTERVAL};

/// Default maximum number of keys the [DefaultServer] stores values for.
pub const MAX_KEYS: usize = 2000;
/// Default maximum number of values per key.
pub const MAX_VALUES_PER_KEY: usize = 100;

/// Verbs every node must answer.
pub const REQUIRED_METHODS: [&str; 5] = [PING, FIND_NODE, FIND_VALUE, GET_VALUE, STORE_VALUE];

/// Dht server that can handle incoming rpc requests
pub trait Server: Debug + Send {
    /// Handle an incoming request, returning the response payload or the error to send back.
    ///
    /// This function will block the main loop where the [crate::rpc::Rpc]
    /// is running, thus it needs to be very fast and lightweight.
    fn handle_request(
        &mut self,
        routing: &dyn Routing,
        from: SocketAddr,
        request: &RequestSpecific,
    ) -> Result<Dict, HandlerError>;

    /// Values this node holds for `key`, used to seed value lookups.
    fn local_values(&mut self, _key: &Id) -> Vec<Bytes> {
        Vec::new()
    }
}

/// What a handler knows about the request besides its arguments.
pub struct RequestContext<'a> {
    pub from: SocketAddr,
    pub routing: &'a dyn Routing,
}

impl RequestContext<'_> {
    /// Our own id, every response carries it.
    pub fn id(&self) -> Id {
        *self.routing.id()
    }
}

/// A typed handler for one verb.
pub type Handler<S> = fn(&mut S, &RequestContext<'_>, &Dict) -> Result<Dict, HandlerError>;

/// Maps verb names to handlers.
pub struct MethodRegistry<S> {
    handlers: HashMap<&'static str, Handler<S>>,
}

impl<S> Debug for MethodRegistry<S> {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        let mut methods = self.handlers.keys().collect::<Vec<_>>();
        methods.sort();

        f.debug_struct("MethodRegistry")
            .field("methods", &methods)
            .finish()
    }
}

impl<S> Default for MethodRegistry<S> {
    fn default() -> Self {
        Self {
            handlers: HashMap::new(),
        }
    }
}

impl<S> MethodRegistry<S> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(mut self, method: &'static str, handler: Handler<S>) -> Self {
        self.handlers.insert(method, handler);
        self
    }

    /// Fails with [Error::MissingHandlers] listing every `required` verb without a handler.
    pub fn validate(&self, required: &[&'static str]) -> Result<()> {
        let missing = required
            .iter()
            .filter(|method| !self.handlers.contains_key(*method))
            .copied()
            .collect::<Vec<_>>();

        if missing.is_empty() {
            Ok(())
        } else {
            Err(Error::MissingHandlers(missing))
        }
    }

    pub fn handler(&self, method: &str) -> Option<Handler<S>> {
        self.handlers.get(method).copied()
    }
}

/// Decode request arguments, failing with a malformed request error.
pub fn arguments<T: DeserializeOwned>(arguments: &Dict) -> Result<T, HandlerError> {
    arguments
        .parse::<T>()
        .map_err(|error| ErrorSpecific::malformed_request(error.to_string()).into())
}

#[derive(Debug, Clone)]
pub struct DefaultServerSettings {
    /// The maximum number of keys to store values for.
    ///
    /// Defaults to [MAX_KEYS]
    pub max_keys: usize,
    /// The maximum number of values stored per key.
    ///
    /// Defaults to [MAX_VALUES_PER_KEY]
    pub max_values_per_key: usize,
    /// Number of nodes returned by `find_node` and `find_value`.
    ///
    /// Defaults to [MAX_BUCKET_SIZE_K]
    pub k: usize,
}

impl Default for DefaultServerSettings {
    fn default() -> Self {
        Self {
            max_keys: MAX_KEYS,
            max_values_per_key: MAX_VALUES_PER_KEY,
            k: MAX_BUCKET_SIZE_K,
        }
    }
}

#[derive(Debug)]
/// Default implementation of [Server] trait.
///
/// Answers the five verbs from an in memory [ValueStore], it doesn't implement
/// any rate-limiting or blocking.
pub struct DefaultServer {
    /// Tokens generator
    pub tokens: Tokens,
    /// Values store
    pub values: ValueStore,
    k: usize,
    registry: MethodRegistry<DefaultServer>,
}

impl Default for DefaultServer {
    fn default() -> Self {
        DefaultServer::new(&DefaultServerSettings::default())
    }
}

impl DefaultServer {
    pub fn new(settings: &DefaultServerSettings) -> Self {
        let registry = MethodRegistry::new()
            .register(PING, Self::ping)
            .register(FIND_NODE, Self::find_node)
            .register(FIND_VALUE, Self::find_value)
            .register(GET_VALUE, Self::get_value)
            .register(STORE_VALUE, Self::store_value);

        Self {
            tokens: Tokens::new(Instant::now()),
            values: ValueStore::new(
                NonZeroUsize::new(settings.max_keys).unwrap_or(NonZeroUsize::MIN),
                NonZeroUsize::new(settings.max_values_per_key).unwrap_or(NonZeroUsize::MIN),
            ),
            k: settings.k,
            registry,
        }
    }

    /// The verbs this server answers.
    pub fn registry(&self) -> &MethodRegistry<DefaultServer> {
        &self.registry
    }

    // === Handlers ===

    fn ping(
        &mut self,
        context: &RequestContext<'_>,
        _arguments: &Dict,
    ) -> Result<Dict, HandlerError> {
        Ok(Dict::from_serializable(&PingResponse { id: context.id() })?)
    }

    fn find_node(
        &mut self,
        context: &RequestContext<'_>,
        arguments: &Dict,
    ) -> Result<Dict, HandlerError> {
        let FindNodeArguments { target, .. } = self::arguments(arguments)?;

        Ok(Dict::from_serializable(&FindNodeResponse {
            id: context.id(),
            nodes: context.routing.closest(&target, self.k),
            token: self.token(context.from),
        })?)
    }

    fn find_value(
        &mut self,
        context: &RequestContext<'_>,
        arguments: &Dict,
    ) -> Result<Dict, HandlerError> {
        let FindValueArguments { key, .. } = self::arguments(arguments)?;

        Ok(Dict::from_serializable(&FindValueResponse {
            id: context.id(),
            nodes: context.routing.closest(&key, self.k),
            token: self.token(context.from),
            num: self.values.count(&key),
        })?)
    }

    fn get_value(
        &mut self,
        context: &RequestContext<'_>,
        arguments: &Dict,
    ) -> Result<Dict, HandlerError> {
        let GetValueArguments { key, num, .. } = self::arguments(arguments)?;

        Ok(Dict::from_serializable(&GetValueResponse {
            id: context.id(),
            values: self.values.get(&key, num),
        })?)
    }

    fn store_value(
        &mut self,
        context: &RequestContext<'_>,
        arguments: &Dict,
    ) -> Result<Dict, HandlerError> {
        let StoreValueArguments {
            id: requester_id,
            key,
            value,
            token,
        } = self::arguments(arguments)?;

        if !self.tokens.validate(context.from, &token) {
            debug!(
                ?key,
                ?requester_id,
                from = ?context.from,
                ?token,
                request_type = "store_value",
                "Invalid token"
            );

            return Err(ErrorSpecific::invalid_token().into());
        }

        self.values.insert(key, value);

        Ok(Dict::from_serializable(&StoreValueResponse { id: context.id() })?)
    }

    fn token(&self, from: SocketAddr) -> Bytes {
        Bytes::copy_from_slice(&self.tokens.generate_token(from))
    }
}

impl Server for DefaultServer {
    fn handle_request(
        &mut self,
        routing: &dyn Routing,
        from: SocketAddr,
        request: &RequestSpecific,
    ) -> Result<Dict, HandlerError> {
        let now = Instant::now();

        // Lazily rotate secrets before handling a request
        if self.tokens.should_update(now) {
            self.tokens.rotate(now)
        }

        let context = RequestContext { from, routing };

        // Copied out of the registry so the handler can borrow the server mutably.
        let handler = self
            .registry
            .handler(&request.method)
            .ok_or_else(|| ErrorSpecific::method_unknown(&request.method))?;

        handler(self, &context, &request.arguments)
    }

    fn local_values(&mut self, key: &Id) -> Vec<Bytes> {
        self.values.get(key, 0)
    }
}
