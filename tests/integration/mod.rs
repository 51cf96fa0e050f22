//! Integration tests for the console data layer

mod durability_test;
mod flush_test;
mod http_adapter_test;
mod resources_test;
mod service_test;
