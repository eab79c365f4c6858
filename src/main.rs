use lux_engine::prelude::*;

#[tokio::main]
async fn main() {
    let options = Options::new();

    if let Err(err) = lux_engine::run(options).await {
        error!("{:?}", err);
        std::process::exit(255);
    }
}
