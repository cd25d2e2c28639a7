use guestlink::cache::Cache;
use guestlink::cipher::{private_key, public_key, KeySession};
use guestlink::config::{BusSection, ConfigFile, Overrides, Settings};
use guestlink::dispatch::Dispatcher;
use guestlink::handlers::{
    builtin_handlers, HostnameHandler, HostsHandler, NetworkHandler, PasswordHandler,
    ResolversHandler,
};
use guestlink::record::{default_functions, parse_functions};
use guestlink::transport::{BusTransport, MemoryStore, Reply, Status, Store, Transport};
use guestlink::HandlerRegistry;
use rand::rngs::StdRng;
use rand::SeedableRng;
use std::path::Path;

const MAC: &str = "aa:bb:cc:dd:ee:ff";

fn fake_sysfs(root: &Path) -> std::path::PathBuf {
    let sysfs = root.join("sys/class/net");
    std::fs::create_dir_all(sysfs.join("eth0")).unwrap();
    std::fs::write(sysfs.join("eth0/address"), format!("{}\n", MAC)).unwrap();
    std::fs::create_dir_all(sysfs.join("lo")).unwrap();
    std::fs::write(sysfs.join("lo/address"), "00:00:00:00:00:00\n").unwrap();
    sysfs
}

fn reply(store: &MemoryStore, token: &str) -> Option<Reply> {
    store
        .get(&format!("data/guest/{}", token))
        .map(|raw| serde_json::from_str(&raw).unwrap())
}

#[tokio::test]
async fn resetnetwork_is_staged_applied_and_acknowledged() {
    let dir = tempfile::tempdir().unwrap();
    let sysfs = fake_sysfs(dir.path());
    let etc = dir.path().join("etc");
    let conf = etc.join("conf.d/net");
    std::fs::create_dir_all(conf.parent().unwrap()).unwrap();
    std::fs::write(etc.join("hosts"), "127.0.0.1 localhost\n::1 localhost\n").unwrap();
    std::fs::write(etc.join("resolv.conf"), "nameserver 10.0.0.53\n").unwrap();

    let store = MemoryStore::new();
    store
        .write(
            "vm-data/networking/aabbccddeeff",
            format!(
                r#"{{"label": "public", "mac": "{}", "gateway": "10.0.0.1",
                    "ips": [{{"ip": "10.0.0.5", "netmask": "255.255.255.0"}}]}}"#,
                MAC
            )
            .as_bytes(),
        )
        .await
        .unwrap();
    store
        .write("data/host/r1", br#"{"name": "resetnetwork", "value": ""}"#)
        .await
        .unwrap();

    let mut bus = BusTransport::open(store.clone(), BusSection::default(), &sysfs)
        .await
        .unwrap();
    let inbound = bus.receive().await.unwrap();
    assert_eq!(inbound.identifier, "r1");
    assert_eq!(inbound.record.function, "resetnetwork");

    // The full default set, with the file-writing handlers kept inside the
    // temp dir. Same-named built-ins registered afterwards are dropped.
    let settings = Settings::resolve(
        dir.path().join("guestlink.toml"),
        ConfigFile::default(),
        &Overrides::default(),
    );
    let mut registry = HandlerRegistry::new();
    registry.register(Box::new(NetworkHandler::new(&conf)));
    registry.register(Box::new(HostsHandler::new(etc.join("hosts"))));
    registry.register(Box::new(HostnameHandler::new(etc.join("hostname"))));
    registry.register(Box::new(ResolversHandler::new(etc.join("resolv.conf"))));
    for handler in builtin_handlers(&settings) {
        registry.register(handler);
    }
    assert_eq!(registry.len(), 9);

    let cache = Cache::new(dir.path().join("cache"));
    let report = Dispatcher::new(&cache)
        .dispatch(&mut registry, &inbound.record, &default_functions())
        .await;

    assert_eq!(report.ran, vec!["NetworkHandler"]);
    assert_eq!(report.applied, parse_functions("network"));
    assert_eq!(report.reply, "");
    assert_eq!(
        std::fs::read_to_string(&conf).unwrap(),
        "config_eth0=\"\n10.0.0.5/24\n\"\nroutes_eth0=\"\ndefault via 10.0.0.1\n\"\n"
    );
    assert!(!etc.join("hostname").exists());
    // The staged copy stays behind for a later `apply`.
    assert_eq!(cache.list().unwrap().len(), 1);

    bus.send(&inbound.identifier, &report.reply, Status::Ok).await;
    assert_eq!(reply(&store, "r1"), Some(Reply::new(Status::Ok, "")));
}

#[tokio::test]
async fn version_request_never_reaches_dispatch() {
    let store = MemoryStore::new();
    store
        .write("data/host/v", br#"{"name": "version", "value": "agent"}"#)
        .await
        .unwrap();
    store
        .write("data/host/w", br#"{"name": "features"}"#)
        .await
        .unwrap();

    let mut bus = BusTransport::open(store.clone(), BusSection::default(), "/nonexistent")
        .await
        .unwrap();
    let inbound = bus.receive().await.unwrap();

    assert_eq!(inbound.record.function, "features");
    let answer = reply(&store, "v").unwrap();
    assert_eq!(answer.returncode, "0");
    assert_eq!(answer.message, guestlink::AGENT_VERSION);
}

#[tokio::test]
async fn password_waits_for_its_key_exchange() {
    let store = MemoryStore::new();
    let bus_settings = BusSection {
        password_retry_ms: 1,
        ..BusSection::default()
    };

    // The guest's private key is the first draw from its seeded generator.
    let guest_private = private_key(&mut StdRng::seed_from_u64(42));
    let host_private = private_key(&mut StdRng::seed_from_u64(7));
    let host = KeySession::from_private(host_private, public_key(guest_private));

    let password = format!(
        r#"{{"name": "password", "value": "{}"}}"#,
        host.encrypt_password("s3cret")
    );
    let keyinit = format!(
        r#"{{"name": "keyinit", "value": "{}"}}"#,
        public_key(host_private)
    );
    store.write("data/host/a", password.as_bytes()).await.unwrap();
    store.write("data/host/b", keyinit.as_bytes()).await.unwrap();

    let mut bus = BusTransport::open_with_rng(
        store.clone(),
        bus_settings,
        "/nonexistent",
        Box::new(StdRng::seed_from_u64(42)),
    )
    .await
    .unwrap();

    let inbound = bus.receive().await.unwrap();
    assert_eq!(inbound.identifier, "a");
    assert_eq!(inbound.record.password.as_deref(), Some("s3cret"));

    let exchange = reply(&store, "b").unwrap();
    assert_eq!(exchange.returncode, "D0");
    assert_eq!(exchange.message, public_key(guest_private).to_string());
    assert!(reply(&store, "a").is_none());

    // An operator allow-list without `password` keeps the handler idle.
    let dir = tempfile::tempdir().unwrap();
    let mut registry = HandlerRegistry::new();
    registry.register(Box::new(PasswordHandler::default()));
    let cache = Cache::new(dir.path().join("cache"));
    let report = Dispatcher::new(&cache)
        .dispatch(
            &mut registry,
            &inbound.record,
            &parse_functions("network,hosts"),
        )
        .await;

    assert!(report.ran.is_empty());
    assert!(report.applied.is_empty());
    assert_eq!(report.reply, "");
}
