use neural_style as ns;
use std::sync::Arc;

fn main() -> Result<(), ns::Error> {
    // a tiny randomly initialized network, random features still carry a
    // surprising amount of texture information
    let network = ns::Network::builder(3)
        .seed(42)
        .conv("conv1", 32, 3)
        .conv("conv2", 32, 3)
        .max_pool("pool1")
        .conv("conv3", 64, 3)
        .build()?;

    // the network can be stored and shared like any other weights file
    std::fs::create_dir_all("out")?;
    let mut file = std::fs::File::create("out/tiny.nsw")?;
    network.write(&mut file)?;

    let session = ns::Session::builder()
        .extractor(Arc::new(network))
        .content(&"imgs/content.jpg")
        .style(&"imgs/style.jpg")
        .content_layers(vec!["conv3"])
        .style_layers(vec!["conv1", "conv2", "conv3"])
        .style_weight(1.0)
        .optimizer(ns::OptimizerKind::GradientDescent)
        .learning_rate(1e3)
        .max_dimension(256)
        .iterations(100)
        .build()?;

    session.run(None, None)?.save("out/03.png")
}
