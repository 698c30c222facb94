pub mod param_configurator;
pub mod parameter_synchronizer;
