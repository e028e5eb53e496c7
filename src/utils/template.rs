//! String template rendering utilities.

pub struct TemplateVars;

impl TemplateVars {
    pub const APP_NAME: &'static str = "app_name";
    pub const DOMAIN: &'static str = "domain";
    pub const DEPLOY_PATH: &'static str = "deploy_path";
    pub const DEPLOY_USER: &'static str = "deploy_user";
    pub const SHARED_DIR: &'static str = "shared_dir";
    pub const SOCKET_PATH: &'static str = "socket_path";
    pub const PID_PATH: &'static str = "pid_path";
    pub const LOG_DIR: &'static str = "log_dir";
    pub const LAUNCHER_PATH: &'static str = "launcher_path";
    pub const PROCESS_CONFIG_PATH: &'static str = "process_config_path";
    pub const PROCESS: &'static str = "process";
}

pub fn render(template: &str, variables: &[(&str, &str)]) -> String {
    let mut result = template.to_string();

    for (key, value) in variables {
        let placeholder = format!("{{{{{}}}}}", key);
        result = result.replace(&placeholder, value);
    }

    result
}

#[cfg(test)]
pub fn is_present(template: &str, key: &str) -> bool {
    let placeholder = format!("{{{{{}}}}}", key);
    template.contains(&placeholder)
}
