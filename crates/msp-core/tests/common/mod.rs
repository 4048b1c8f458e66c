pub mod site_admin;
