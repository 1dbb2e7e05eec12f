//! Radix-tree request router with a middleware chain.
//!
//! One tree per HTTP method. A request runs through every registered
//! middleware, in registration order, before it reaches the matched handler.
//! Unmatched requests go through the same chain and end in a `404`, so they
//! are logged like any other request.

use std::collections::HashMap;
use std::sync::Arc;

use http::{Method, StatusCode};
use matchit::Router as MatchitRouter;

use crate::handler::{BoxedHandler, ErasedHandler, Handler};
use crate::middleware::{Middleware, Next};
use crate::request::Request;
use crate::response::ResponseBuffer;

async fn not_found(_req: Request) -> StatusCode {
    StatusCode::NOT_FOUND
}

/// The application router.
///
/// Build it once at startup and hand it to [`Server::serve`](crate::Server::serve).
/// Every method returns `self` so registrations chain:
///
/// ```rust,no_run
/// # use tsu_access::{Request, Router};
/// # use tsu_access::middleware::{AccessLog, Recovery};
/// # async fn get_user(_: Request) -> &'static str { "" }
/// # async fn create_user(_: Request) -> &'static str { "" }
/// Router::new()
///     .middleware(Recovery::new())
///     .middleware(AccessLog::default())
///     .get("/users/{id}", get_user)
///     .post("/users", create_user);
/// ```
pub struct Router {
    routes: HashMap<Method, MatchitRouter<BoxedHandler>>,
    middleware: Vec<Arc<dyn Middleware>>,
    not_found: BoxedHandler,
}

impl Router {
    pub fn new() -> Self {
        Self {
            routes: HashMap::new(),
            middleware: Vec::new(),
            not_found: not_found.into_boxed_handler(),
        }
    }

    /// Registers `handler` for `method` and `path`. Path parameters use
    /// `{name}` syntax and are read with [`Request::param`].
    ///
    /// # Panics
    ///
    /// Panics if `path` is not a valid route or conflicts with one already
    /// registered for `method`.
    pub fn on(mut self, method: Method, path: &str, handler: impl Handler) -> Self {
        self.routes
            .entry(method)
            .or_default()
            .insert(path, handler.into_boxed_handler())
            .unwrap_or_else(|e| panic!("invalid route `{path}`: {e}"));
        self
    }

    pub fn get(self, path: &str, handler: impl Handler) -> Self {
        self.on(Method::GET, path, handler)
    }

    pub fn post(self, path: &str, handler: impl Handler) -> Self {
        self.on(Method::POST, path, handler)
    }

    pub fn put(self, path: &str, handler: impl Handler) -> Self {
        self.on(Method::PUT, path, handler)
    }

    pub fn delete(self, path: &str, handler: impl Handler) -> Self {
        self.on(Method::DELETE, path, handler)
    }

    /// Appends a middleware. The first one registered is the outermost.
    pub fn middleware(mut self, middleware: impl Middleware) -> Self {
        self.middleware.push(Arc::new(middleware));
        self
    }

    fn lookup(&self, method: &Method, path: &str) -> Option<(BoxedHandler, HashMap<String, String>)> {
        let matched = self.routes.get(method)?.at(path).ok()?;
        let params = matched
            .params
            .iter()
            .map(|(k, v)| (k.to_owned(), v.to_owned()))
            .collect();
        Some((Arc::clone(matched.value), params))
    }

    /// Runs `req` through the middleware chain and the matched handler.
    pub async fn dispatch(&self, mut req: Request) -> ResponseBuffer {
        let endpoint = match self.lookup(req.method(), req.path()) {
            Some((handler, params)) => {
                req.set_route(handler.name(), params);
                handler
            }
            None => Arc::clone(&self.not_found),
        };

        let mut writer = ResponseBuffer::new();
        Next::new(&self.middleware, &endpoint).run(req, &mut writer).await;
        writer
    }
}

impl Default for Router {
    fn default() -> Self { Self::new() }
}

#[cfg(test)]
mod tests {
    use bytes::Bytes;
    use http_body_util::Full;

    use super::*;
    use crate::middleware::BoxFuture;
    use crate::response::ResponseWriter;

    fn request(method: Method, uri: &str) -> Request {
        let req = http::Request::builder().method(method).uri(uri).body(Full::new(Bytes::new())).unwrap();
        Request::from_http(req, None)
    }

    async fn show_user(req: Request) -> String {
        format!("user {}", req.param("id").unwrap_or("?"))
    }

    struct Tag(&'static str);

    impl Middleware for Tag {
        fn handle<'a>(
            &'a self,
            req: Request,
            writer: &'a mut dyn ResponseWriter,
            next: Next<'a>,
        ) -> BoxFuture<'a, ()> {
            Box::pin(async move {
                writer.write(self.0.as_bytes());
                next.run(req, writer).await;
            })
        }
    }

    #[tokio::test]
    async fn matched_route_gets_its_params() {
        let router = Router::new().get("/users/{id}", show_user);
        let res = router.dispatch(request(Method::GET, "/users/42")).await;

        assert_eq!(res.status(), StatusCode::OK);
        assert_eq!(res.body(), b"user 42");
    }

    #[tokio::test]
    async fn unmatched_method_or_path_is_404() {
        let router = Router::new().get("/users/{id}", show_user);

        assert_eq!(router.dispatch(request(Method::POST, "/users/42")).await.status(), StatusCode::NOT_FOUND);
        assert_eq!(router.dispatch(request(Method::GET, "/nope")).await.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn middleware_run_in_registration_order() {
        let router = Router::new()
            .middleware(Tag("a"))
            .middleware(Tag("b"))
            .get("/", |_req: Request| async { "!" });

        let res = router.dispatch(request(Method::GET, "/")).await;
        assert_eq!(res.body(), b"ab!");
    }
}
