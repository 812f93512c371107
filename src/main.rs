fn main() {
    airtime_lib::run()
}
