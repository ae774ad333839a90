fn main() {
    linenet_pipeline::cli::run();
}
