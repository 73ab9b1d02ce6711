use neural_style as ns;
use std::{sync::Arc, time::Duration};

fn main() -> Result<(), ns::Error> {
    let mut weights = std::fs::File::open("weights/vgg16.nsw")?;
    let network = ns::Network::read(&mut weights)?;

    let session = ns::Session::builder()
        .extractor(Arc::new(network))
        .content(&"imgs/content.jpg")
        .style(&"imgs/style.jpg")
        .iterations(1000)
        // keep 10 images spread over the run
        .snapshot_count(10)
        .build()?;

    // give up after a minute, keeping whatever was found until then
    let token = ns::CancelToken::new();
    {
        let token = token.clone();
        std::thread::spawn(move || {
            std::thread::sleep(Duration::from_secs(60));
            token.cancel();
        });
    }

    let (progress, updates) = ns::ChannelProgress::bounded(16);
    let printer = std::thread::spawn(move || {
        for update in updates {
            println!(
                "{}/{} loss {:.1} best {:.1} @ {}",
                update.iteration.current,
                update.iteration.total,
                update.loss.total,
                update.best_loss.total,
                update.best_iteration,
            );
        }
    });

    let result = session.run(Some(Box::new(progress)), Some(&token))?;
    // the sender was dropped with the session, so this finishes
    let _ = printer.join();

    println!("{:?} after {} iterations", result.status(), result.iterations_run());
    result.save_snapshots("out/02")?;
    result.save("out/02.jpg")
}
