//! Calls from a channel to a server over the in-process hub.

use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tether::prelude::*;
use tether::transport::MemHub;
use tether::JsonCodec;
use tether::security::NullSecurityHandler;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct Entity {
    id: u32,
    name: String,
    description: Option<String>,
    tags: Vec<String>,
}

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .try_init();
}

fn store() -> Interface {
    Interface::new("demo.Store")
        .method("ping", 0, Returns::Void)
        .method("add", 2, Returns::Value)
        .method("describe", 1, Returns::Value)
        .method("lookup", 1, Returns::Value)
        .method("rename", 2, Returns::Value)
        .method("nap", 1, Returns::Void)
        .method("fail", 0, Returns::Void)
        .method("deny", 0, Returns::Void)
}

fn store_binding() -> ServiceBinding {
    ServiceBinding::new(store())
        .bind_void("ping", |_| Ok(()))
        .bind("add", |p: &Params| Ok(p.get::<i32>(0)? + p.get::<i32>(1)?))
        .bind("describe", |p: &Params| {
            let entity: Entity = p.get(0)?;
            Ok(format!("{}:{}", entity.id, entity.name))
        })
        .bind_optional("lookup", |p: &Params| {
            let id: u32 = p.get(0)?;
            Ok((id == 7).then(|| Entity {
                id,
                name: "seven".into(),
                description: None,
                tags: vec!["lucky".into()],
            }))
        })
        .bind("rename", |p: &Params| {
            let mut entity: Entity = p.get(0)?;
            match p.optional::<String>(1)? {
                Some(name) => entity.name = name,
                None => entity.description = Some("unnamed".into()),
            }
            Ok(entity)
        })
        .bind_void("nap", |p: &Params| {
            thread::sleep(Duration::from_millis(p.get(0)?));
            Ok(())
        })
        .bind_void("fail", |_| Err("the disk is full".into()))
        .bind_void("deny", |_| Err(RpcError::permission_denied("nope").into()))
}

struct Fixture {
    server: Server,
    channel: Channel,
}

fn fixture(address: &str, server_options: ServerOptions, channel_options: ChannelOptions) -> Fixture {
    init_tracing();
    let hub = Arc::new(MemHub::new());
    let server = Server::new(
        address,
        hub.clone(),
        Arc::new(NullSecurityHandler),
        server_options,
    );
    server.register(store_binding()).unwrap();
    server.start().unwrap();
    let channel =
        Channel::open(address, hub, Arc::new(NullSecurityHandler), channel_options).unwrap();
    Fixture { server, channel }
}

fn simple(address: &str) -> Fixture {
    fixture(address, ServerOptions::default(), ChannelOptions::default())
}

fn entity() -> Entity {
    Entity {
        id: 1,
        name: "ent".into(),
        description: Some("first".into()),
        tags: vec!["a".into(), "b".into()],
    }
}

#[test]
fn void_and_primitive_methods() {
    let f = simple("inproc://rpc-primitive");
    let iface = store();

    f.channel.invoke_void(&iface, "ping", f.channel.args()).unwrap();
    let args = f.channel.args().arg(&40).unwrap().arg(&2).unwrap();
    let sum: Option<i32> = f.channel.invoke(&iface, "add", args).unwrap();
    assert_eq!(sum, Some(42));

    let metrics = f.channel.metrics();
    assert_eq!(metrics.messages_sent, 2);
    assert_eq!(metrics.messages_received, 2);
    assert_eq!(f.server.metrics().messages_received, 2);
}

#[test]
fn structured_values_and_nulls() {
    let f = simple("inproc://rpc-structured");
    let iface = store();

    let args = f.channel.args().arg(&entity()).unwrap();
    let described: Option<String> = f.channel.invoke(&iface, "describe", args).unwrap();
    assert_eq!(described.as_deref(), Some("1:ent"));

    let found: Option<Entity> = f
        .channel
        .invoke(&iface, "lookup", f.channel.args().arg(&7u32).unwrap())
        .unwrap();
    assert_eq!(found.unwrap().name, "seven");
    let missing: Option<Entity> = f
        .channel
        .invoke(&iface, "lookup", f.channel.args().arg(&8u32).unwrap())
        .unwrap();
    assert_eq!(missing, None);

    let renamed: Option<Entity> = f
        .channel
        .invoke(
            &iface,
            "rename",
            f.channel
                .args()
                .arg(&entity())
                .unwrap()
                .arg(&"other")
                .unwrap(),
        )
        .unwrap();
    assert_eq!(renamed.unwrap().name, "other");

    let unnamed: Option<Entity> = f
        .channel
        .invoke(
            &iface,
            "rename",
            f.channel.args().arg(&entity()).unwrap().null(),
        )
        .unwrap();
    assert_eq!(unnamed.unwrap().description.as_deref(), Some("unnamed"));
}

#[test]
fn null_for_a_required_argument() {
    let f = simple("inproc://rpc-null-arg");
    let err = f
        .channel
        .invoke::<String>(&store(), "describe", f.channel.args().null())
        .unwrap_err();
    assert_eq!(err.code, ErrorCode::InvalidArgument);
}

#[test]
fn concurrent_callers_get_their_own_replies() {
    let f = simple("inproc://rpc-concurrent");
    let channel = Arc::new(f.channel);
    let iface = Arc::new(store());

    let callers: Vec<_> = (0..16)
        .map(|i| {
            let channel = channel.clone();
            let iface = iface.clone();
            thread::spawn(move || {
                let args = channel.args().arg(&i).unwrap().arg(&1000).unwrap();
                channel.invoke::<i32>(&iface, "add", args).unwrap()
            })
        })
        .collect();
    for (i, caller) in callers.into_iter().enumerate() {
        assert_eq!(caller.join().unwrap(), Some(i as i32 + 1000));
    }
}

#[test]
fn inherited_methods() {
    init_tracing();
    let hub = Arc::new(MemHub::new());
    let base = Interface::new("demo.Named").method("name", 0, Returns::Value);
    let derived = Interface::new("demo.Greeter")
        .method("greet", 1, Returns::Value)
        .extends(base);

    let server: Server = Server::bind("inproc://rpc-inherit", hub.clone());
    server
        .register(
            ServiceBinding::new(derived.clone())
                .bind("name", |_| Ok("greeter"))
                .bind("greet", |p: &Params| Ok(format!("hi {}", p.get::<String>(0)?))),
        )
        .unwrap();
    server.start().unwrap();

    let channel: Channel = Channel::connect("inproc://rpc-inherit", hub).unwrap();
    let name: Option<String> = channel.invoke(&derived, "name", channel.args()).unwrap();
    assert_eq!(name.as_deref(), Some("greeter"));
    let greeting: Option<String> = channel
        .invoke(&derived, "greet", channel.args().arg(&"bob").unwrap())
        .unwrap();
    assert_eq!(greeting.as_deref(), Some("hi bob"));
}

#[test]
fn registration_is_checked() {
    init_tracing();
    let hub = Arc::new(MemHub::new());
    let server: Server = Server::bind("inproc://rpc-register", hub);
    server.register(store_binding()).unwrap();

    let err = server.register(store_binding()).unwrap_err();
    assert_eq!(err.code, ErrorCode::AlreadyExists);

    let overloaded = Interface::new("demo.Overloaded")
        .method("put", 1, Returns::Void)
        .extends(Interface::new("demo.Base").method("put", 2, Returns::Void));
    let err = server
        .register(ServiceBinding::new(overloaded).bind_void("put", |_| Ok(())))
        .unwrap_err();
    assert_eq!(err.code, ErrorCode::Unimplemented);
    assert!(err.message.starts_with("Method overloading is not supported yet."));

    server.start().unwrap();
    let err = server.start().unwrap_err();
    assert_eq!(err.code, ErrorCode::AlreadyExists);

    // Services can still be added while running.
    server
        .register(
            ServiceBinding::new(Interface::new("demo.Late").method("ping", 0, Returns::Void))
                .bind_void("ping", |_| Ok(())),
        )
        .unwrap();
}

#[test]
fn bad_calls_are_rejected() {
    let f = simple("inproc://rpc-bad-calls");
    let iface = store();

    let err = f
        .channel
        .invoke_void(&iface, "missing", f.channel.args())
        .unwrap_err();
    assert_eq!(err.code, ErrorCode::NotFound);

    let err = f
        .channel
        .invoke::<i32>(&iface, "add", f.channel.args().arg(&1).unwrap())
        .unwrap_err();
    assert_eq!(err.code, ErrorCode::InvalidArgument);

    let err = f
        .channel
        .invoke_void(&iface, "add", f.channel.args().arg(&1).unwrap().arg(&2).unwrap())
        .unwrap_err();
    assert_eq!(err.code, ErrorCode::InvalidArgument);

    // Known locally, unknown to the server.
    let stranger = Interface::new("demo.Stranger").method("ping", 0, Returns::Void);
    let err = f
        .channel
        .invoke_void(&stranger, "ping", f.channel.args())
        .unwrap_err();
    assert_eq!(err.code, ErrorCode::NotFound);

    // Wrong argument type on the server side.
    let err = f
        .channel
        .invoke::<String>(&iface, "describe", f.channel.args().arg(&"text").unwrap())
        .unwrap_err();
    assert_eq!(err.code, ErrorCode::Unimplemented);
}

#[test]
fn method_errors_reach_the_caller() {
    let f = simple("inproc://rpc-method-errors");
    let iface = store();

    let err = f
        .channel
        .invoke_void(&iface, "fail", f.channel.args())
        .unwrap_err();
    assert_eq!(err.code, ErrorCode::Unknown);
    assert!(err.message.contains("the disk is full"));

    let err = f
        .channel
        .invoke_void(&iface, "deny", f.channel.args())
        .unwrap_err();
    assert_eq!(err.code, ErrorCode::PermissionDenied);
    assert_eq!(err.message, "nope");
}

#[test]
fn client_timeout_and_late_reply() {
    let f = fixture(
        "inproc://rpc-client-timeout",
        ServerOptions::default(),
        ChannelOptions::default().with_wait_overhead(Duration::from_millis(10)),
    );
    let iface = store();

    let started = Instant::now();
    let err = f
        .channel
        .invoke_void_with_timeout(
            &iface,
            "nap",
            f.channel.args().arg(&200u64).unwrap(),
            Duration::from_millis(20),
        )
        .unwrap_err();
    assert_eq!(err.code, ErrorCode::DeadlineExceeded);
    assert!(started.elapsed() < Duration::from_millis(150));

    // The reply still arrives and is recognised as stale.
    let deadline = Instant::now() + Duration::from_secs(2);
    while f.channel.metrics().stale_replies == 0 && Instant::now() < deadline {
        thread::sleep(Duration::from_millis(5));
    }
    assert_eq!(f.channel.metrics().stale_replies, 1);

    // The channel is still usable.
    f.channel.invoke_void(&iface, "ping", f.channel.args()).unwrap();
}

#[test]
fn server_bounds_execution() {
    let f = fixture(
        "inproc://rpc-server-timeout",
        ServerOptions::default().with_call_timeout(Duration::from_millis(30)),
        ChannelOptions::default().with_call_timeout(Duration::from_secs(2)),
    );
    let started = Instant::now();
    let err = f
        .channel
        .invoke_void(&store(), "nap", f.channel.args().arg(&500u64).unwrap())
        .unwrap_err();
    assert_eq!(err.code, ErrorCode::DeadlineExceeded);
    assert_eq!(err.message, "Call has timed out.");
    assert!(started.elapsed() < Duration::from_millis(400));
}

#[test]
fn full_arena_fails_fast() {
    let f = fixture(
        "inproc://rpc-arena-full",
        ServerOptions::default(),
        ChannelOptions::default().with_arena_capacity(1),
    );
    let channel = Arc::new(f.channel);
    let iface = Arc::new(store());

    let slow = {
        let channel = channel.clone();
        let iface = iface.clone();
        thread::spawn(move || {
            channel.invoke_void(&iface, "nap", channel.args().arg(&200u64).unwrap())
        })
    };
    thread::sleep(Duration::from_millis(50));

    let err = channel
        .invoke_void(&iface, "ping", channel.args())
        .unwrap_err();
    assert_eq!(err.code, ErrorCode::Unavailable);
    assert_eq!(channel.metrics().calls_rejected, 1);

    slow.join().unwrap().unwrap();
    channel.invoke_void(&iface, "ping", channel.args()).unwrap();
}

#[test]
fn json_codec_end_to_end() {
    init_tracing();
    let hub = Arc::new(MemHub::new());
    let iface = Interface::new("demo.Json").method("echo", 1, Returns::Value);

    let server = Server::<JsonCodec>::bind("inproc://rpc-json", hub.clone());
    server
        .register(
            ServiceBinding::<JsonCodec>::new(iface.clone())
                .bind("echo", |p: &Params<JsonCodec>| p.get::<Entity>(0).map_err(Into::into)),
        )
        .unwrap();
    server.start().unwrap();

    let channel = Channel::<JsonCodec>::connect("inproc://rpc-json", hub).unwrap();
    let echoed: Option<Entity> = channel
        .invoke(&iface, "echo", channel.args().arg(&entity()).unwrap())
        .unwrap();
    assert_eq!(echoed, Some(entity()));
}

#[test]
fn duplicated_replies_are_stale() {
    init_tracing();
    let faults = Arc::new(tether::transport::FaultInjector::new());
    faults.set_duplicate_rate(10_000);
    let hub = Arc::new(MemHub::new().with_fault_injector(faults));

    let server: Server = Server::bind("inproc://rpc-duplicates", hub.clone());
    server.register(store_binding()).unwrap();
    server.start().unwrap();
    let channel: Channel = Channel::connect("inproc://rpc-duplicates", hub).unwrap();

    for i in 0..5 {
        let args = channel.args().arg(&i).unwrap().arg(&1).unwrap();
        let sum: Option<i32> = channel.invoke(&store(), "add", args).unwrap();
        assert_eq!(sum, Some(i + 1));
    }

    let deadline = Instant::now() + Duration::from_secs(2);
    while channel.metrics().stale_replies < 5 && Instant::now() < deadline {
        thread::sleep(Duration::from_millis(5));
    }
    let metrics = channel.metrics();
    assert_eq!(metrics.messages_received, 5);
    assert_eq!(metrics.stale_replies, 5);
}
