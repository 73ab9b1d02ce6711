use neural_style as ns;
use std::sync::Arc;

fn main() -> Result<(), ns::Error> {
    // load pretrained VGG16 weights, converted to the network weights format
    let mut weights = std::fs::File::open("weights/vgg16.nsw")?;
    let network = ns::Network::read(&mut weights)?;

    let session = ns::Session::builder()
        .extractor(Arc::new(network))
        // the structure of this image is kept
        .content(&"imgs/content.jpg")
        // and the textures and colors of this one are applied to it
        .style(&"imgs/style.jpg")
        .iterations(250)
        .build()?;

    let result = session.run(None, None)?;

    // save the lowest loss image to the disk
    result.save("out/01.jpg")
}
