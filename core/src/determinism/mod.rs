pub mod json_canonical;
