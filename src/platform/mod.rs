pub mod platform_service;
