use neural_style as ns;

fn main() -> Result<(), ns::Error> {
    let session = ns::Session::builder()
        // the image whose layout we want to keep
        .content(&"imgs/landscape.png")
        // the image whose texture we want to apply, it is resized to the
        // size of the content image
        .style(&"imgs/swirls.png")
        // torchvision's VGG-19 weights exported to safetensors
        .weights(&"models/vgg19.safetensors")
        .image_size(256)
        .steps(300)
        .build()?;

    // print the losses every 50 steps
    let progress = |update: ns::ProgressUpdate<'_>| {
        if update.step % 50 == 0 {
            println!(
                "step {}/{}: style loss {:.4} content loss {:.4}",
                update.step, update.total, update.losses.style, update.losses.content
            );
        }
    };

    let generated = session.run(Some(Box::new(progress)))?;

    // save the result to the disk
    generated.save("out/01.jpg")
}
