use std::sync::Arc;

use profile_recorder::server::{profiler_router, resolve_listen_url, serve, ListenUrl};
use tokio_util::sync::CancellationToken;

fn main() {
    env_logger::init();

    let listen = match resolve_listen_url() {
        Ok(listen) => listen,
        Err(err) => {
            eprintln!("{err}");
            std::process::exit(1);
        }
    };
    run_server_main(listen);
}

#[tokio::main]
async fn run_server_main(listen: ListenUrl) {
    let router = Arc::new(profiler_router());
    let shutdown = CancellationToken::new();

    {
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                shutdown.cancel();
            }
        });
    }

    if let Err(err) = serve(listen, router, shutdown).await {
        eprintln!("server error: {err}");
        std::process::exit(1);
    }
}
