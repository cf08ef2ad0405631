pub mod object;
pub mod object_array;
pub mod object_class;
pub mod object_enum;
pub mod object_function;
pub mod object_manager;
pub mod object_map;
pub mod object_native_function;
pub mod object_string;
