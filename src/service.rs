pub mod port_binding;
