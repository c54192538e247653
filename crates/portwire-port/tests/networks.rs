//! 多个网络上下文之间的场景：共享名字存储的远程管理、重名输入与组播发现兜底。

use std::net::Ipv4Addr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use portwire_core::error::codes;
use portwire_core::{
    Bottle, DiscoveryConfig, ErrorKind, InMemoryNameStore, NameStore, NetworkConfig, PortInfo,
    PortInfoKind, Value,
};
use portwire_port::{Network, Port};
use portwire_transport::{MulticastDiscovery, pick_free_port};
use tokio::sync::broadcast;
use tokio::time::timeout;
use tracing_test::traced_test;

const PATIENCE: Duration = Duration::from_secs(5);

async fn read_one(port: &Port) -> Result<Bottle> {
    let bottle = timeout(PATIENCE, port.read()).await??;
    bottle.ok_or_else(|| anyhow::anyhow!("端口已关闭"))
}

async fn wait_for(
    events: &mut broadcast::Receiver<PortInfo>,
    kind: PortInfoKind,
    created: bool,
) -> Result<PortInfo> {
    timeout(PATIENCE, async {
        loop {
            let info = events.recv().await?;
            if info.kind == kind && info.created == created {
                return Ok::<_, anyhow::Error>(info);
            }
        }
    })
    .await?
}

fn sharing(store: &Arc<InMemoryNameStore>) -> Result<Network> {
    let store: Arc<dyn NameStore> = store.clone();
    Ok(Network::builder().name_store(store).build()?)
}

#[tokio::test(flavor = "multi_thread")]
async fn remote_port_connects_on_request() -> Result<()> {
    let store = Arc::new(InMemoryNameStore::new());
    let left = sharing(&store)?;
    let right = sharing(&store)?;

    let source = left.open_port("/left/out").await?;
    let sink = right.open_port("/right/in").await?;

    let route = right.connect("/left/out", "/right/in", None).await?;
    assert_eq!(route.from_name(), "/left/out");
    assert_eq!(source.outputs().len(), 1, "远端端口已新增输出");

    source.write(&Bottle::new().with("across")).await?;
    let bottle = read_one(&sink).await?;
    assert_eq!(bottle.get(0).and_then(Value::as_str), Some("across"));

    right.disconnect("/left/out", "/right/in").await?;
    assert!(source.outputs().is_empty());
    let err = right
        .disconnect("/left/out", "/right/in")
        .await
        .expect_err("连接已拆除");
    assert_eq!(err.code(), codes::NO_CONNECTION);

    let err = right
        .connect("/left/out", "/ghost", None)
        .await
        .expect_err("远端无法解析目标");
    assert_eq!(err.kind(), ErrorKind::NameNotFound);

    left.shutdown().await;
    right.shutdown().await;
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
#[traced_test]
async fn duplicate_source_replaces_older_input() -> Result<()> {
    let store = Arc::new(InMemoryNameStore::new());
    let first = sharing(&store)?;
    let second = sharing(&store)?;

    let sink = first.open_port("/sink").await?;
    let mut events = sink.subscribe();
    let early = first.open_port("/twin").await?;
    early.add_output("/sink", None).await?;
    wait_for(&mut events, PortInfoKind::Incoming, true).await?;

    let late = second.open_port("/twin").await?;
    late.add_output("/sink", None).await?;
    wait_for(&mut events, PortInfoKind::Incoming, false).await?;

    let inputs = sink.inputs();
    assert_eq!(inputs.len(), 1);
    assert_eq!(inputs[0].from_name(), "/twin");
    assert!(logs_contain("replacing duplicate input"));

    late.write(&Bottle::new().with("late")).await?;
    let bottle = read_one(&sink).await?;
    assert_eq!(bottle.get(0).and_then(Value::as_str), Some("late"));
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn discovery_covers_an_unreachable_store() -> Result<()> {
    let group = DiscoveryConfig {
        enabled: true,
        group: Ipv4Addr::LOCALHOST,
        port: pick_free_port(Ipv4Addr::LOCALHOST)?,
    };

    let advertiser = Network::builder()
        .config(NetworkConfig {
            discovery: group.clone(),
            ..NetworkConfig::default()
        })
        .build()?;
    let sink = advertiser.open_port("/far/sink").await?;

    let broken = Arc::new(InMemoryNameStore::new());
    broken.set_available(false);
    let broken_store: Arc<dyn NameStore> = broken.clone();
    let seeker = Network::builder()
        .config(NetworkConfig::default().with_query_timeout(Duration::from_millis(500)))
        .name_store(broken_store)
        .discovery(Arc::new(MulticastDiscovery::new(group, Duration::from_secs(2))))
        .build()?;

    let err = seeker.open_port("/near/source").await.expect_err("存储不可达，无法登记");
    assert_eq!(err.kind(), ErrorKind::StoreUnavailable);

    let source = seeker.open_port("").await?;
    source.add_output("/far/sink", None).await?;
    source.write(&Bottle::new().with("found")).await?;
    let bottle = read_one(&sink).await?;
    assert_eq!(bottle.get(0).and_then(Value::as_str), Some("found"));

    let err = seeker.resolve("/nowhere").await.expect_err("发现也无应答");
    assert_eq!(err.kind(), ErrorKind::StoreUnavailable);

    seeker.shutdown().await;
    advertiser.shutdown().await;
    Ok(())
}

/// 等到名字存储里的活跃度达到期望值。
async fn activity_reaches(store: &InMemoryNameStore, name: &str, expected: i64) -> Result<()> {
    timeout(PATIENCE, async {
        while store.activity(name) != Some(expected) {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await?;
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn connections_are_announced_to_the_name_store() -> Result<()> {
    let store = Arc::new(InMemoryNameStore::new());
    let network = sharing(&store)?;
    let source = network.open_port("/busy/out").await?;
    let _sink = network.open_port("/busy/in").await?;
    assert_eq!(store.activity("/busy/out"), Some(0));

    network.connect("/busy/out", "/busy/in", None).await?;
    activity_reaches(&store, "/busy/out", 1).await?;
    activity_reaches(&store, "/busy/in", 1).await?;

    assert!(source.remove_output("/busy/in").await);
    activity_reaches(&store, "/busy/out", 0).await?;
    activity_reaches(&store, "/busy/in", 0).await?;
    network.shutdown().await;
    Ok(())
}
