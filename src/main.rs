use mailsubmit::MainContext;

fn main() {
    let cli_args: Vec<String> = std::env::args().collect();
    let config_path = env!("MAILSUBMIT_CONFIG_PATH");

    let ctx = MainContext {
        args: cli_args,
        config_path: config_path.to_string(),
    };

    let stdin = std::io::stdin();
    let mut handle = stdin.lock();
    let mut stdout = std::io::stdout();

    if let Err(e) = mailsubmit::run(&ctx, &mut handle, &mut stdout) {
        eprintln!("Error: {:#}", e);
        std::process::exit(1);
    }
}
