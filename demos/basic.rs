//! Access log, trace ids and panic recovery in front of a few JSON routes.
//!
//! Run with:
//!   RUST_LOG=info cargo run --example basic
//!   LOG_FORMAT=json cargo run --example basic
//!
//! Try:
//!   curl -i http://localhost:3000/users/42 -H 'x-trace-id: abc-123'
//!   curl -i http://localhost:3000/users/0          # recorded error, logged at ERROR
//!   curl -i -X POST http://localhost:3000/users -d '{"name":"alice"}'
//!   curl -i http://localhost:3000/panic            # 500, server keeps going
//!   curl -i http://localhost:3000/healthz          # not logged

use http::StatusCode;
use tsu_access::middleware::{AccessLog, AccessLogConfig, Recovery};
use tsu_access::{logging, BoxError, Request, Response, ResponseWriter, Router, Server};

#[tokio::main]
async fn main() -> Result<(), BoxError> {
    logging::init()?;

    let access_log = AccessLogConfig::default()
        .skip_path("/healthz")
        .details_with_body(true)
        .details_with_context_keys(true);

    let app = Router::new()
        .middleware(Recovery::with_handler(|_ctx, writer: &mut dyn ResponseWriter| {
            writer.write(br#"{"error":"internal"}"#);
        }))
        .middleware(AccessLog::new(access_log))
        .get("/users/{id}", get_user)
        .post("/users", create_user)
        .get("/panic", explode)
        .get("/healthz", |_req: Request| async { "ok" });

    Server::bind(([0, 0, 0, 0], 3000).into()).serve(app).await?;
    Ok(())
}

async fn get_user(req: Request) -> Response {
    let id = req.param("id").unwrap_or_default().to_owned();
    let ctx = req.context();
    if let Err(err) = ctx.set("user_id", &id) {
        ctx.record_error(err);
    }

    if id == "0" {
        ctx.record_error("user 0 is reserved");
        return Response::status(StatusCode::NOT_FOUND);
    }
    if let Some(logger) = ctx.logger() {
        logger.info("loading user");
    }
    Response::json(format!(r#"{{"id":"{id}","name":"alice"}}"#))
}

async fn create_user(mut req: Request) -> Response {
    match req.bytes().await {
        Ok(body) if !body.is_empty() => Response::builder()
            .status(StatusCode::CREATED)
            .header("location", "/users/99")
            .json(r#"{"id":"99"}"#),
        Ok(_) => Response::status(StatusCode::BAD_REQUEST),
        Err(err) => {
            req.context().record_error(err);
            Response::status(StatusCode::BAD_REQUEST)
        }
    }
}

async fn explode(_req: Request) -> Response {
    panic!("something went very wrong")
}
