fn main() {
    flashdeck_backend::run()
}
