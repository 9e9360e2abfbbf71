fn main() {
    keras_remote::logger::init_logger();
    keras_remote::runner::main()
}
