/// Echo 示例：同一进程内的服务端与客户端
///
/// 服务端监听回环地址，注册 `tserver` 回显服务；客户端通过 `Proxy` 发起调用，
/// 最后打印两端的运行快照。

use anyhow::Context;
use bytes::Bytes;
use msgrpc::{service_fn, InboundCall, Messenger};
use std::time::Duration;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_max_level(tracing::Level::INFO)
        .init();

    println!("🌟 msgrpc echo 示例");

    let server = Messenger::builder("tserver")
        .set_num_reactors(2)
        .build()
        .context("failed to build server messenger")?;
    server.register_service(
        "tserver",
        service_fn(|call: InboundCall| {
            tracing::info!("📥 {}.{} from {}", call.service(), call.method(), call.remote());
            let payload = call.payload().clone();
            call.respond_success(payload);
        }),
    )?;
    let endpoint = server.listen_address("127.0.0.1:0".parse()?)?;
    server.start_acceptor()?;
    println!("✅ 服务端监听 {}", endpoint);

    let client = Messenger::builder("tclient")
        .set_num_reactors(4)
        .set_connection_keepalive_time(Duration::from_secs(5))
        .build()
        .context("failed to build client messenger")?;
    let proxy = client.proxy(endpoint, "tserver");

    for i in 0..10 {
        let payload = Bytes::from(format!("hello #{}", i));
        let reply = proxy.call("echo", payload).await?;
        println!("📤 -> 📥 {}", String::from_utf8_lossy(&reply));
    }

    let unknown = client.proxy(endpoint, "nope");
    if let Err(e) = unknown.call("echo", Bytes::from_static(b"?")).await {
        println!("ℹ️ 未注册的服务: {}", e);
    }

    let dump = client.dump_running_rpcs().await?;
    println!("📊 客户端快照:\n{}", serde_json::to_string_pretty(&dump)?);
    let dump = server.dump_running_rpcs().await?;
    println!("📊 服务端快照:\n{}", serde_json::to_string_pretty(&dump)?);

    for stats in client.reactor_stats() {
        println!("📈 {:?}", stats);
    }

    client.shutdown();
    server.shutdown();
    println!("🛑 已关闭");
    Ok(())
}
