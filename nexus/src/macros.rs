cfgenius::define! {
    pub darwin = cfg(target_vendor="apple");
    pub linux_like = cfg(any(target_os="linux", target_os="android"));
}
