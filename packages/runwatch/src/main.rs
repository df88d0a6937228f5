fn main() {
    if let Err(err) = runwatch::cli::run() {
        tracing::error!(error = %err, "runwatch failed");
        std::process::exit(1);
    }
}
