//! Built-in handlers linked into the binary, standing in for user code.

use std::sync::Arc;

use http::{Request, Response};

use strato_runtime::{BufferedHandler, Handler, HandlerRegistry, NativeHandler, ResponseSink};

pub fn built_in_registry() -> HandlerRegistry {
    let mut registry = HandlerRegistry::new();
    registry.register("hello", || {
        Ok(Arc::new(NativeHandler::new(hello)) as Arc<dyn Handler>)
    });
    registry.register("hello-buffered", || {
        Ok(Arc::new(BufferedHandler::new(hello_buffered)) as Arc<dyn Handler>)
    });
    registry
}

/// Native convention: return the full response.
fn hello(request: Request<Vec<u8>>) -> anyhow::Result<Response<Vec<u8>>> {
    let body = serde_json::json!({
        "greeting": "Hello from strato!",
        "method": request.method().as_str(),
        "path": request.uri().path(),
    });
    Ok(Response::builder()
        .status(200)
        .header("content-type", "application/json")
        .body(body.to_string().into_bytes())?)
}

/// Legacy buffered convention: write into the sink and finish it.
fn hello_buffered(_request: &Request<Vec<u8>>, sink: &mut ResponseSink) -> anyhow::Result<()> {
    sink.set_status(200)?;
    sink.append_header("content-type", "text/plain")?;
    sink.write(b"Hello from strato!");
    sink.end();
    Ok(())
}

#[cfg(test)]
mod tests {
    use strato_runtime::HandlerLoader;

    use super::*;

    fn request(path: &str) -> Request<Vec<u8>> {
        Request::builder()
            .method("GET")
            .uri(format!("https://fn.example.test{path}"))
            .body(Vec::new())
            .expect("request")
    }

    #[test]
    fn functional_hello_reports_method_and_path() {
        let handler = built_in_registry().load("hello").expect("load");
        let response = handler.invoke(request("/greet")).expect("invoke");
        let body: serde_json::Value = serde_json::from_slice(response.body()).expect("json");
        assert_eq!(body["method"], "GET");
        assert_eq!(body["path"], "/greet");
    }

    #[test]
    fn functional_hello_buffered_finishes_its_sink() {
        let handler = built_in_registry().load("hello-buffered").expect("load");
        let response = handler.invoke(request("/")).expect("invoke");
        assert_eq!(response.status().as_u16(), 200);
        assert_eq!(response.body().as_slice(), b"Hello from strato!");
    }
}
