use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use crossbeam::channel::{self, Receiver};
use restline::{
    Backpressure, CorsPolicy, GroupConfig, HandlerError, HandlerResult, HttpContext, HttpService,
    ManipulatorError, Method, Request, Route, RouteError, Router, RoutingEntry, ServiceConfig,
    StatusCode,
};

const WAIT: Duration = Duration::from_secs(5);

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

fn get(path: &str) -> HttpContext {
    HttpContext::new(Request::new(Method::Get, path))
}

fn body(ctx: &HttpContext) -> &str {
    std::str::from_utf8(ctx.response().body_ref()).unwrap()
}

fn header<'a>(ctx: &'a HttpContext, name: &str) -> Option<&'a str> {
    ctx.response().headers().get(name)
}

type Log = Arc<Mutex<Vec<String>>>;

fn push(log: &Log, event: impl Into<String>) {
    log.lock().unwrap().push(event.into());
}

fn recv(output: &Receiver<HttpContext>) -> HttpContext {
    output.recv_timeout(WAIT).expect("service produced no response")
}

#[test]
fn scenario_a_parameter_binding_and_default_content_type() {
    init_tracing();
    let mut service = HttpService::new(ServiceConfig::default()).unwrap();
    service
        .register(Route::from_fn(Method::Get, "/items/{id}", "default", |ctx| {
            let id = ctx.params().get("id").unwrap_or_default().to_owned();
            ctx.response_mut().set_body(id);
            Ok(())
        }))
        .unwrap();

    let output = service.start().unwrap();
    service.submit(get("/items/42")).unwrap();
    let done = recv(&output);

    assert_eq!(done.response().status(), StatusCode::Ok);
    assert_eq!(done.params().get("id"), Some("42"));
    assert_eq!(body(&done), "42");
    assert_eq!(header(&done, "content-type"), Some("text/plain; charset=utf-8"));
}

#[test]
fn scenario_b_literal_route_wins() {
    let mut service = HttpService::new(ServiceConfig::default()).unwrap();
    service
        .register(Route::from_fn(Method::Get, "/items", "default", |ctx| {
            ctx.response_mut().set_body("list");
            Ok(())
        }))
        .unwrap();
    service
        .register(Route::from_fn(Method::Get, "/items/{id}", "default", |ctx| {
            ctx.response_mut().set_body("one");
            Ok(())
        }))
        .unwrap();

    let output = service.start().unwrap();
    service.submit(get("/items")).unwrap();
    assert_eq!(body(&recv(&output)), "list");
    service.submit(get("/items/7")).unwrap();
    assert_eq!(body(&recv(&output)), "one");
}

#[test]
fn scenario_c_not_found_keeps_cors() {
    let calls = Arc::new(AtomicUsize::new(0));
    let mut service = HttpService::new(ServiceConfig::default()).unwrap();
    let counter = Arc::clone(&calls);
    service
        .register(Route::from_fn(Method::Get, "/items/{id}", "default", move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }))
        .unwrap();

    let output = service.start().unwrap();
    service.submit(get("/unknown")).unwrap();
    let done = recv(&output);

    assert_eq!(done.response().status(), StatusCode::NotFound);
    assert_eq!(calls.load(Ordering::SeqCst), 0);
    assert_eq!(header(&done, "access-control-allow-origin"), Some("*"));
    assert_eq!(header(&done, "content-type"), Some("application/json"));
    assert!(body(&done).contains("/unknown"));
}

#[test]
fn scenario_d_single_lane_preserves_order() {
    let log: Log = Arc::default();
    let mut service = HttpService::new(ServiceConfig::default()).unwrap();
    let seen = Arc::clone(&log);
    service
        .register(Route::from_fn(Method::Get, "/r/{n}", "default", move |ctx| {
            push(&seen, ctx.params().get("n").unwrap_or_default());
            Ok(())
        }))
        .unwrap();

    let output = service.start().unwrap();
    for n in 1..=10 {
        service.submit(get(&format!("/r/{n}"))).unwrap();
    }
    let finished: Vec<String> = (0..10)
        .map(|_| recv(&output).params().get("n").unwrap().to_owned())
        .collect();

    let expected: Vec<String> = (1..=10).map(|n| n.to_string()).collect();
    assert_eq!(*log.lock().unwrap(), expected);
    assert_eq!(finished, expected);
}

#[test]
fn scenario_e_post_failure_still_sets_content_type() {
    let mut service = HttpService::new(ServiceConfig::default()).unwrap();
    service
        .register(Route::from_fn(Method::Get, "/x", "default", |ctx| {
            ctx.response_mut().set_body("fine");
            Ok(())
        }))
        .unwrap();
    service.group_mut("default").unwrap().add_post(
        |_: &mut HttpContext, _: &RoutingEntry| -> Result<(), ManipulatorError> {
            Err(ManipulatorError::new("post manipulator exploded"))
        },
    );

    let output = service.start().unwrap();
    service.submit(get("/x")).unwrap();
    let done = recv(&output);

    assert_eq!(done.response().status(), StatusCode::InternalServerError);
    assert_eq!(header(&done, "content-type"), Some("application/json"));
    assert!(body(&done).contains("post manipulator exploded"));
    assert!(header(&done, "access-control-allow-origin").is_some());
}

#[test]
fn p1_resolution_is_deterministic() {
    let mut router = Router::new();
    for pattern in ["/a/{x}", "/a/b", "/{y}/b", "/a/b/c", "/{p}/{q}"] {
        router
            .register(Route::from_fn(Method::Get, pattern, "default", |_| Ok(())))
            .unwrap();
    }
    for path in ["/a/b", "/a/z", "/z/b", "/z/z", "/a/b/c"] {
        let first = router.resolve(&Method::Get, path).unwrap();
        for _ in 0..50 {
            let again = router.resolve(&Method::Get, path).unwrap();
            assert!(Arc::ptr_eq(&first.entry, &again.entry), "{path}");
            assert_eq!(first.params, again.params);
        }
    }
}

#[test]
fn p2_literal_precedence_regardless_of_registration_order() {
    for patterns in [["/a/{x}", "/a/b"], ["/a/b", "/a/{x}"]] {
        let mut router = Router::new();
        for pattern in patterns {
            router
                .register(Route::from_fn(Method::Get, pattern, "default", |_| Ok(())))
                .unwrap();
        }
        let hit = router.resolve(&Method::Get, "/a/b").unwrap();
        assert_eq!(hit.entry.pattern(), "/a/b");
        assert!(hit.params.is_empty());
    }
}

#[test]
fn p3_duplicate_rejected_and_tree_unchanged() {
    let mut router = Router::new();
    router
        .register(Route::from_fn(Method::Get, "/dup", "default", |ctx| {
            ctx.response_mut().set_body("first");
            Ok(())
        }))
        .unwrap();

    let err = router
        .register(Route::from_fn(Method::Get, "/dup", "other", |_| Ok(())))
        .unwrap_err();
    assert!(matches!(err, RouteError::Conflict { .. }));
    assert_eq!(router.len(), 1);

    let hit = router.resolve(&Method::Get, "/dup").unwrap();
    assert_eq!(hit.entry.processing_group(), "default");
    let mut ctx = get("/dup");
    hit.entry.invoke(&mut ctx).unwrap();
    assert_eq!(body(&ctx), "first");

    // a different method is a different route
    router
        .register(Route::from_fn(Method::Post, "/dup", "default", |_| Ok(())))
        .unwrap();
}

#[test]
fn p4_manipulator_order() {
    let log: Log = Arc::default();
    let mut service = HttpService::new(ServiceConfig::default()).unwrap();

    let seen = Arc::clone(&log);
    service
        .register(Route::from_fn(Method::Get, "/order", "default", move |_| {
            push(&seen, "handler");
            Ok(())
        }))
        .unwrap();

    let group = service.group_mut("default").unwrap();
    for label in ["pre-1", "pre-2"] {
        let seen = Arc::clone(&log);
        group.add_pre(
            move |ctx: &mut HttpContext, _: &RoutingEntry| -> Result<(), ManipulatorError> {
                // internal pre manipulators already ran
                assert!(ctx.response().content_type().is_some());
                assert!(ctx.response().headers().contains("access-control-allow-origin"));
                push(&seen, label);
                Ok(())
            },
        );
    }
    for label in ["post-1", "post-2"] {
        let seen = Arc::clone(&log);
        group.add_post(
            move |ctx: &mut HttpContext, _: &RoutingEntry| -> Result<(), ManipulatorError> {
                // internal post manipulators have not run yet
                assert!(!ctx.response().headers().contains("content-type"));
                push(&seen, label);
                Ok(())
            },
        );
    }

    let output = service.start().unwrap();
    service.submit(get("/order")).unwrap();
    let done = recv(&output);

    assert_eq!(done.response().status(), StatusCode::Ok);
    assert_eq!(
        *log.lock().unwrap(),
        vec!["pre-1", "pre-2", "handler", "post-1", "post-2"]
    );
    assert_eq!(header(&done, "content-type"), Some("text/plain; charset=utf-8"));
}

#[test]
fn p5_cors_survives_user_tampering() {
    let mut service = HttpService::new(ServiceConfig::default()).unwrap();
    service
        .register(Route::from_fn(Method::Get, "/cors", "default", |ctx| {
            ctx.response_mut()
                .set_header("Access-Control-Allow-Origin", "https://handler.test");
            Ok(())
        }))
        .unwrap();
    let group = service.group_mut("default").unwrap();
    group.add_pre(
        |ctx: &mut HttpContext, _: &RoutingEntry| -> Result<(), ManipulatorError> {
            ctx.response_mut().headers_mut().clear();
            Ok(())
        },
    );
    group.add_post(
        |ctx: &mut HttpContext, _: &RoutingEntry| -> Result<(), ManipulatorError> {
            ctx.response_mut().headers_mut().remove("access-control-allow-methods");
            Ok(())
        },
    );

    let output = service.start().unwrap();
    service.submit(get("/cors")).unwrap();
    let done = recv(&output);

    let origins: Vec<_> = done
        .response()
        .headers()
        .get_all("access-control-allow-origin")
        .collect();
    assert_eq!(origins, vec!["*"]);
    assert_eq!(
        header(&done, "access-control-allow-methods"),
        Some("GET, POST, PUT, DELETE")
    );
    assert!(header(&done, "access-control-allow-headers").is_some());
}

#[test]
fn p6_failures_are_isolated_to_their_request() {
    init_tracing();
    let mut service = HttpService::new(ServiceConfig::default()).unwrap();
    service
        .register(Route::from_fn(Method::Get, "/fail", "default", |_| {
            Err(HandlerError::failed("handler refused"))
        }))
        .unwrap();
    service
        .register(Route::from_fn(Method::Get, "/panic", "default", |_| {
            panic!("handler blew up")
        }))
        .unwrap();
    service
        .register(Route::from_fn(Method::Get, "/ok", "default", |ctx| {
            ctx.response_mut().set_body("ok");
            Ok(())
        }))
        .unwrap();

    let output = service.start().unwrap();
    for path in ["/fail", "/ok", "/panic", "/ok"] {
        service.submit(get(path)).unwrap();
    }

    let statuses: Vec<_> = (0..4).map(|_| recv(&output).response().status()).collect();
    assert_eq!(
        statuses,
        vec![
            StatusCode::InternalServerError,
            StatusCode::Ok,
            StatusCode::InternalServerError,
            StatusCode::Ok,
        ]
    );
}

#[test]
fn routes_run_on_their_group() {
    let config = ServiceConfig::default().with_group(GroupConfig::new("io"));
    let mut service = HttpService::new(config).unwrap();
    let handler = |ctx: &mut HttpContext| -> HandlerResult {
        let lane = thread::current().name().unwrap_or_default().to_owned();
        ctx.response_mut().set_body(lane);
        Ok(())
    };
    service
        .register(Route::from_fn(Method::Get, "/fast", "default", handler))
        .unwrap();
    service
        .register(
            Route::from_fn(Method::Get, "/slow", "io", handler).content_type("application/json"),
        )
        .unwrap();

    let output = service.start().unwrap();
    service.submit(get("/fast")).unwrap();
    let fast = recv(&output);
    service.submit(get("/slow")).unwrap();
    let slow = recv(&output);

    assert_eq!(body(&fast), "restline-default-0");
    assert_eq!(body(&slow), "restline-io-0");
    assert_eq!(header(&slow, "content-type"), Some("application/json"));
}

#[test]
fn multi_lane_runs_requests_concurrently() {
    let config = ServiceConfig::default().with_group(GroupConfig::multi("pool", 2));
    let mut service = HttpService::new(config).unwrap();

    let (started_tx, started_rx) = channel::unbounded::<()>();
    let (gate_tx, gate_rx) = channel::unbounded::<()>();
    service
        .register(Route::from_fn(Method::Get, "/work", "pool", move |_| {
            started_tx.send(()).ok();
            gate_rx
                .recv_timeout(WAIT)
                .map_err(|_| HandlerError::failed("gate never opened"))
        }))
        .unwrap();

    let output = service.start().unwrap();
    service.submit(get("/work")).unwrap();
    service.submit(get("/work")).unwrap();

    // both handlers are in flight at once
    started_rx.recv_timeout(WAIT).unwrap();
    started_rx.recv_timeout(WAIT).unwrap();
    gate_tx.send(()).unwrap();
    gate_tx.send(()).unwrap();

    for _ in 0..2 {
        assert_eq!(recv(&output).response().status(), StatusCode::Ok);
    }
}

#[test]
fn full_group_queue_answers_503_with_cors() {
    init_tracing();
    let config = ServiceConfig::default()
        .with_backpressure(Backpressure::Reject)
        .with_group(GroupConfig::new("narrow").with_queue_capacity(1));
    let mut service = HttpService::new(config).unwrap();

    let (started_tx, started_rx) = channel::unbounded::<()>();
    let (gate_tx, gate_rx) = channel::unbounded::<()>();
    service
        .register(Route::from_fn(Method::Get, "/slow", "narrow", move |_| {
            started_tx.send(()).ok();
            gate_rx
                .recv_timeout(WAIT)
                .map_err(|_| HandlerError::failed("gate never opened"))
        }))
        .unwrap();

    let output = service.start().unwrap();
    let first = get("/slow");
    let first_id = first.id();
    service.submit(first).unwrap();
    // the worker holds the first request, the queue is empty again
    started_rx.recv_timeout(WAIT).unwrap();

    let second = get("/slow");
    let second_id = second.id();
    service.submit(second).unwrap();
    let third = get("/slow");
    let third_id = third.id();
    service.submit(third).unwrap();

    let rejected = recv(&output);
    assert_eq!(rejected.id(), third_id);
    assert_eq!(rejected.response().status(), StatusCode::ServiceUnavailable);
    assert_eq!(header(&rejected, "access-control-allow-origin"), Some("*"));
    assert_eq!(header(&rejected, "content-type"), Some("application/json"));

    gate_tx.send(()).unwrap();
    gate_tx.send(()).unwrap();
    let mut done: Vec<_> = (0..2).map(|_| recv(&output)).collect();
    done.sort_by_key(HttpContext::id);
    assert_eq!(done[0].id(), first_id);
    assert_eq!(done[1].id(), second_id);
    assert!(done.iter().all(|c| c.response().status() == StatusCode::Ok));
}

#[test]
fn submitter_feeds_from_other_threads() {
    let mut service = HttpService::new(ServiceConfig::default()).unwrap();
    service
        .register(Route::from_fn(Method::Post, "/echo", "default", |ctx| {
            let payload = ctx.request().body().clone();
            ctx.response_mut().set_body(payload.to_vec());
            Ok(())
        }))
        .unwrap();

    let output = service.start().unwrap();
    let producers: Vec<_> = (0..4)
        .map(|i| {
            let submitter = service.submitter();
            thread::spawn(move || {
                let request = Request::new(Method::Post, "/echo").with_body(format!("msg-{i}"));
                submitter.submit(HttpContext::new(request)).unwrap();
            })
        })
        .collect();
    for producer in producers {
        producer.join().unwrap();
    }

    let mut bodies: Vec<String> = (0..4).map(|_| body(&recv(&output)).to_owned()).collect();
    bodies.sort();
    assert_eq!(bodies, vec!["msg-0", "msg-1", "msg-2", "msg-3"]);
}

#[test]
fn preflight_gets_max_age() {
    let mut service = HttpService::new(ServiceConfig::default()).unwrap();
    service
        .register(Route::from_fn(Method::Options, "/items", "default", |ctx| {
            ctx.response_mut().set_status(StatusCode::NoContent);
            Ok(())
        }))
        .unwrap();

    let output = service.start().unwrap();
    let request = Request::new(Method::Options, "/items").header("Origin", "https://a.test");
    service.submit(HttpContext::new(request)).unwrap();
    let done = recv(&output);
    assert_eq!(done.response().status(), StatusCode::NoContent);
    assert_eq!(header(&done, "access-control-max-age"), Some("3600"));
}

#[test]
fn echoed_origin_keeps_handler_vary() {
    let config = ServiceConfig::default().with_cors(CorsPolicy::new().allow_origin("https://a.test"));
    let mut service = HttpService::new(config).unwrap();
    service
        .register(Route::from_fn(Method::Get, "/gz", "default", |ctx| {
            ctx.response_mut().set_header("Vary", "Accept-Encoding");
            Ok(())
        }))
        .unwrap();

    let output = service.start().unwrap();
    let request = Request::new(Method::Get, "/gz").header("Origin", "https://a.test");
    service.submit(HttpContext::new(request)).unwrap();
    let done = recv(&output);

    assert_eq!(header(&done, "access-control-allow-origin"), Some("https://a.test"));
    let vary: Vec<_> = done.response().headers().get_all("vary").collect();
    assert_eq!(vary, vec!["Accept-Encoding, Origin"]);
}

#[test]
fn stop_lets_in_flight_request_finish() {
    init_tracing();
    let mut service = HttpService::new(ServiceConfig::default()).unwrap();
    let (started_tx, started_rx) = channel::unbounded::<()>();
    service
        .register(Route::from_fn(Method::Get, "/slow", "default", move |ctx| {
            started_tx.send(()).ok();
            thread::sleep(Duration::from_millis(150));
            ctx.response_mut().set_body("finished");
            Ok(())
        }))
        .unwrap();

    let output = service.start().unwrap();
    let request = get("/slow");
    let id = request.id();
    service.submit(request).unwrap();
    started_rx.recv_timeout(WAIT).unwrap();

    service.stop();
    assert!(!service.is_running());

    let done = recv(&output);
    assert_eq!(done.id(), id);
    assert_eq!(done.response().status(), StatusCode::Ok);
    assert_eq!(body(&done), "finished");
}

#[test]
fn idle_stop_is_bounded_by_one_poll() {
    let config = ServiceConfig {
        poll_timeout_ms: 100,
        ..ServiceConfig::default()
    }
    .with_group(GroupConfig::new("default").with_timeout_ms(100))
    .with_group(GroupConfig::multi("pool", 3).with_timeout_ms(100));
    let mut service = HttpService::new(config).unwrap();
    let _output = service.start().unwrap();
    // let every stage settle into its blocking receive
    thread::sleep(Duration::from_millis(50));

    let started = Instant::now();
    service.stop();
    let took = started.elapsed();
    assert!(took < Duration::from_millis(250), "stop took {took:?}");
}
