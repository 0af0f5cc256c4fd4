use sandals::{MixedProxy, DEFAULT_BIND_ADDRESS};

fn print_usage_and_exit(arg0: String) {
    eprintln!("Usage: {} [--threads/-t N] [--bind/-b ADDRESS]", arg0);
    std::process::exit(1);
}

fn main() {
    env_logger::init();

    let mut args: Vec<String> = std::env::args().collect();
    let arg0 = args.remove(0);
    let mut num_threads = 0usize;
    let mut bind_address = DEFAULT_BIND_ADDRESS.to_string();

    while !args.is_empty() && args[0].starts_with('-') {
        if args[0] == "--threads" || args[0] == "-t" {
            args.remove(0);
            if args.is_empty() {
                eprintln!("Missing threads argument.");
                print_usage_and_exit(arg0);
                return;
            }
            num_threads = match args.remove(0).parse::<usize>() {
                Ok(n) => n,
                Err(e) => {
                    eprintln!("Invalid thread count: {}", e);
                    print_usage_and_exit(arg0);
                    return;
                }
            };
        } else if args[0] == "--bind" || args[0] == "-b" {
            args.remove(0);
            if args.is_empty() {
                eprintln!("Missing bind argument.");
                print_usage_and_exit(arg0);
                return;
            }
            bind_address = args.remove(0);
        } else {
            eprintln!("Invalid argument: {}", args[0]);
            print_usage_and_exit(arg0);
            return;
        }
    }

    if !args.is_empty() {
        eprintln!("Unexpected argument: {}", args[0]);
        print_usage_and_exit(arg0);
        return;
    }

    if num_threads == 0 {
        num_threads = std::cmp::max(
            2,
            std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(1),
        );
    }

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(num_threads)
        .enable_io()
        .enable_time()
        .build()
        .expect("Could not build tokio runtime");

    runtime.block_on(async move {
        println!("Starting mixed proxy server on {}..", bind_address);

        MixedProxy::new()
            .with_bind_address(&bind_address)
            .listen_and_serve()
            .await
            .unwrap();
    });
}
