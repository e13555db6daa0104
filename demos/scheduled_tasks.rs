/// 延迟任务示例
///
/// 演示 schedule_on_reactor / abort_on_reactor / remove_scheduled_task 三种结局。

use msgrpc::Messenger;
use std::sync::mpsc;
use std::time::Duration;

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_max_level(tracing::Level::INFO)
        .init();

    let messenger = Messenger::builder("scheduler-demo")
        .set_num_reactors(2)
        .set_coarse_timer_granularity(Duration::from_millis(10))
        .build()?;
    let (tx, rx) = mpsc::channel();

    let fired = {
        let tx = tx.clone();
        messenger.schedule_on_reactor(Duration::from_millis(100), move |status| {
            let thread = std::thread::current().name().unwrap_or_default().to_string();
            let _ = tx.send(format!("⏰ fired: {:?} on {}", status, thread));
        })?
    };

    let aborted = {
        let tx = tx.clone();
        messenger.schedule_on_reactor(Duration::from_secs(30), move |status| {
            let _ = tx.send(format!("🛑 aborted task callback: {:?}", status));
        })?
    };
    messenger.abort_on_reactor(aborted)?;

    let removed = {
        let tx = tx.clone();
        messenger.schedule_on_reactor(Duration::from_millis(50), move |status| {
            let _ = tx.send(format!("removed task ran anyway: {:?}", status));
        })?
    };
    messenger.remove_scheduled_task(removed)?;
    drop(tx);

    for line in rx.iter() {
        println!("{}", line);
    }

    println!("{} on reactor {}", fired, messenger.scheduled_task_reactor(fired));
    if let Err(e) = messenger.remove_scheduled_task(fired) {
        println!("ℹ️ remove after firing: {}", e);
    }

    messenger.shutdown();
    Ok(())
}
