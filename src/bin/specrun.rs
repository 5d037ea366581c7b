// specrun command-line entry point
// Usage: specrun [--config FILE] [-v] <run|list|cache> ...

fn main() {
    specrun::cli::run();
}
