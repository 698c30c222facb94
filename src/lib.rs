pub mod config;
pub mod crazyflie;
pub mod crtp;
pub mod param;
pub mod platform;
pub mod radio;
pub mod toc;
pub mod util;
pub mod test_util;


#[cfg(test)]
mod test {
    use tracing::Level;

    #[ctor::ctor]
    fn init_test_logging() {
        tracing_subscriber::fmt()
            .with_test_writer()
            .with_max_level(Level::DEBUG)
            .try_init()
            .ok();
    }
}
